/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::sync::Arc;
use std::time::Duration;

use ferrobus::prelude::*;
use ferrobus_core::bus::NAME_OWNER_CHANGED;
use ferrobus_core::error::names::{MATCH_RULE_INVALID, MATCH_RULE_NOT_FOUND, NAME_HAS_NO_OWNER};
use ferrobus_core::names::{BUS_INTERFACE, BUS_NAME, BUS_PATH};
use ferrobus_core::BusAddress;
use ferrobus_daemon::Daemon;
use tokio::sync::mpsc;

mod setup;

use crate::setup::*;

fn echo_object() -> anyhow::Result<Arc<dyn BusObject>> {
    Ok(ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Echo")?
                .typed_method("Echo", |ctx: CallContext, (text,): (String,)| async move {
                    Ok::<_, MethodError>((format!("{text} from {}", ctx.sender.unwrap_or_default()),))
                })?,
        )
        .build())
}

fn execution_name(error: &BusError) -> Option<&str> {
    match error {
        BusError::Execution { name, .. } => Some(name),
        _ => None,
    }
}

/// Clients get distinct unique names and see each other in `ListNames`.
#[tokio::test]
async fn test_clients_register_and_list_names() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let first = bus.client().await?;
    let second = bus.client().await?;

    let first_name = first.unique_name().ok_or_else(|| anyhow::anyhow!("no unique name"))?;
    let second_name = second.unique_name().ok_or_else(|| anyhow::anyhow!("no unique name"))?;
    assert_ne!(first_name, second_name);

    let names = first.bus().list_names().await?;
    assert!(names.contains(&BUS_NAME.to_string()));
    assert!(names.contains(&first_name));
    assert!(names.contains(&second_name));

    assert_eq!(first.bus().get_id().await?, bus.daemon.guid());
    assert_eq!(first.bus().list_activatable_names().await?, vec![BUS_NAME.to_string()]);
    first.bus().ping().await?;
    assert!(bus.daemon.stats().connections_accepted() >= 2);
    Ok(())
}

/// A well-known name has one owner; it becomes available again on release.
#[tokio::test]
async fn test_name_ownership_is_exclusive() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let first = bus.client().await?;
    let second = bus.client().await?;

    first.request_name("org.example.Service").await?;
    assert!(matches!(
        second.request_name("org.example.Service").await,
        Err(BusError::NameTaken(_))
    ));
    assert_eq!(
        second.bus().get_name_owner("org.example.Service").await?,
        first.unique_name().unwrap_or_default()
    );

    assert!(first.release_name("org.example.Service").await?);
    assert!(!first.release_name("org.example.Service").await?);

    second.request_name("org.example.Service").await?;
    assert_eq!(
        first.bus().get_name_owner("org.example.Service").await?,
        second.unique_name().unwrap_or_default()
    );
    Ok(())
}

/// The first requester keeps a name whatever flags either side passes.
#[tokio::test]
async fn test_owned_name_is_never_handed_over() -> anyhow::Result<()> {
    use ferrobus_core::bus::{
        RequestNameReply, NAME_FLAG_ALLOW_REPLACEMENT, NAME_FLAG_REPLACE_EXISTING,
    };

    initialize_tracing();
    let bus = TestBus::start().await?;
    let first = bus.client().await?;
    let second = bus.client().await?;

    let reply = first
        .bus()
        .request_name("org.example.Handover", NAME_FLAG_ALLOW_REPLACEMENT)
        .await?;
    assert_eq!(reply, RequestNameReply::PrimaryOwner);
    let reply = first
        .bus()
        .request_name("org.example.Handover", NAME_FLAG_ALLOW_REPLACEMENT)
        .await?;
    assert_eq!(reply, RequestNameReply::AlreadyOwner);

    let reply = second
        .bus()
        .request_name("org.example.Handover", NAME_FLAG_REPLACE_EXISTING)
        .await?;
    assert_eq!(reply, RequestNameReply::Exists);
    assert_eq!(
        second.bus().get_name_owner("org.example.Handover").await?,
        first.unique_name().unwrap_or_default()
    );
    Ok(())
}

/// Unique names and the bus name itself cannot be requested.
#[tokio::test]
async fn test_reserved_names_are_rejected() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let client = bus.client().await?;

    let error = client.bus().request_name(BUS_NAME, 0).await.err();
    assert!(matches!(error, Some(BusError::InvalidArgs(_))));
    let error = client.bus().request_name(":1.99", 0).await.err();
    assert!(matches!(error, Some(BusError::InvalidArgs(_))));
    Ok(())
}

/// Calls are routed to the owner of a well-known or unique name, and the
/// daemon stamps the caller's unique name as sender.
#[tokio::test]
async fn test_calls_are_routed_between_clients() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let caller = bus.client().await?;
    let service = bus.client().await?;
    service.export("/org/example/Echo", echo_object()?)?;
    service.request_name("org.example.Echo").await?;

    let caller_name = caller.unique_name().unwrap_or_default();
    let proxy = caller.proxy(Some("org.example.Echo"), "/org/example/Echo", "org.example.Echo")?;
    let reply: String = proxy.call_typed("Echo", ("hello",)).await?;
    assert_eq!(reply, format!("hello from {caller_name}"));

    let service_name = service.unique_name().unwrap_or_default();
    let proxy = caller.proxy(Some(&service_name), "/org/example/Echo", "org.example.Echo")?;
    let reply: String = proxy.call_typed("Echo", ("again",)).await?;
    assert_eq!(reply, format!("again from {caller_name}"));

    assert!(bus.daemon.stats().messages_routed() >= 4);
    Ok(())
}

/// Calls to names nobody owns fail with `ServiceUnknown`.
#[tokio::test]
async fn test_unknown_destination_is_reported() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let client = bus.client().await?;

    let proxy = client.proxy(Some("org.example.Nobody"), "/org/example", "org.example.Echo")?;
    let result = proxy.call_typed::<_, String>("Echo", ("x",)).await;
    assert!(matches!(result, Err(BusError::ServiceUnknown(_))));

    let result = client.bus().get_name_owner("org.example.Nobody").await;
    let error = result.err().ok_or_else(|| anyhow::anyhow!("expected an error"))?;
    assert_eq!(execution_name(&error), Some(NAME_HAS_NO_OWNER));
    assert!(!client.bus().name_has_owner("org.example.Nobody").await?);
    Ok(())
}

/// Signals reach the clients whose match rules select them, with the
/// emitter's unique name as sender.
#[tokio::test]
async fn test_signals_follow_match_rules() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let emitter = bus.client().await?;
    let listener = bus.client().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let key = SignalKey::new("org.example.Events", "Tick")?;
    listener
        .add_signal_handler(key, move |signal| {
            let _ = tx.send(signal);
        })
        .await?;

    emitter.emit_signal("/org/example", "org.example.Events", "Other", vec![])?;
    emitter.emit_signal(
        "/org/example",
        "org.example.Events",
        "Tick",
        vec![Value::UInt32(1)],
    )?;

    let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("handler dropped"))?;
    assert_eq!(signal.member(), Some("Tick"));
    assert_eq!(signal.sender(), emitter.unique_name().as_deref());
    assert!(bus.daemon.match_stats().signals_matched() >= 1);
    Ok(())
}

/// Malformed rules and unknown rules are reported with their own errors.
#[tokio::test]
async fn test_match_rule_errors() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let client = bus.client().await?;

    let error = client.bus().add_match("type='bogus'").await.err();
    assert_eq!(error.as_ref().and_then(execution_name), Some(MATCH_RULE_INVALID));

    let error = client
        .bus()
        .remove_match("type='signal',member='Never'")
        .await
        .err();
    assert_eq!(error.as_ref().and_then(execution_name), Some(MATCH_RULE_NOT_FOUND));

    client.bus().add_match("type='signal',member='Once'").await?;
    client.bus().remove_match("type='signal',member='Once'").await?;
    Ok(())
}

/// When a client goes away its names are released and announced.
#[tokio::test]
async fn test_disconnect_releases_names() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let observer = bus.client().await?;
    let service = bus.client().await?;
    service.request_name("org.example.Leaving").await?;
    let service_name = service.unique_name().unwrap_or_default();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let key = SignalKey::new(BUS_INTERFACE, NAME_OWNER_CHANGED)?;
    observer
        .add_signal_handler(key, move |signal| {
            let _ = tx.send(signal.into_body());
        })
        .await?;

    service.disconnect();

    let released = vec![
        Value::String("org.example.Leaving".to_string()),
        Value::String(service_name.clone()),
        Value::String(String::new()),
    ];
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(body) = rx.recv().await {
            if body == released {
                return Ok(());
            }
        }
        Err(anyhow::anyhow!("handler dropped"))
    })
    .await??;

    assert!(!observer.bus().name_has_owner("org.example.Leaving").await?);
    assert!(!observer.bus().name_has_owner(&service_name).await?);
    Ok(())
}

/// The bus object answers introspection and rejects unknown methods and
/// service activation.
#[tokio::test]
async fn test_bus_object_surface() -> anyhow::Result<()> {
    initialize_tracing();
    let bus = TestBus::start().await?;
    let client = bus.client().await?;

    let introspectable = client.proxy(Some(BUS_NAME), BUS_PATH, "org.freedesktop.DBus.Introspectable")?;
    let xml: String = introspectable.call_typed("Introspect", ()).await?;
    assert!(xml.contains("<interface name=\"org.freedesktop.DBus\">"));

    let driver = client.proxy(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE)?;
    let result = driver.call_typed::<_, ()>("Frobnicate", ()).await;
    assert!(matches!(result, Err(BusError::UnknownMethod(_))));

    let result = driver
        .call_typed::<_, u32>("StartServiceByName", ("org.example.Lazy", 0u32))
        .await;
    assert!(matches!(result, Err(BusError::ServiceUnknown(_))));

    let uid = client
        .bus()
        .get_connection_unix_user(&client.unique_name().unwrap_or_default())
        .await;
    assert!(uid.is_ok());
    Ok(())
}

/// The daemon can listen on tcp with a kernel-assigned port.
#[tokio::test]
async fn test_tcp_listener_reports_bound_port() -> anyhow::Result<()> {
    initialize_tracing();
    let daemon = Daemon::bind(test_config(), &[BusAddress::tcp("127.0.0.1", 0)]).await?;
    let address = daemon.addresses()[0].clone();
    assert_ne!(address.get("port"), Some("0"));
    assert_eq!(address.guid(), Some(daemon.guid()));

    let client = ConnectionBuilder::address(&address.to_string())?
        .config(test_config())
        .build()
        .await?;
    client.bus().ping().await?;

    daemon.shutdown();
    tokio::time::timeout(Duration::from_secs(5), daemon.wait()).await?;
    Ok(())
}
