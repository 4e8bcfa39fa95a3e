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

use std::time::Duration;

use ferrobus::prelude::*;
use ferrobus_core::error::names::FAILED;
use tokio::sync::mpsc;

mod setup;

use crate::setup::*;

fn echo_object() -> anyhow::Result<std::sync::Arc<dyn BusObject>> {
    Ok(ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Echo")?
                .typed_method("Echo", |_ctx, (text,): (String,)| async move {
                    Ok::<_, MethodError>((text,))
                })?,
        )
        .build())
}

fn labelled(label: &'static str) -> anyhow::Result<std::sync::Arc<dyn BusObject>> {
    Ok(ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Tree")?.typed_method(
                "Which",
                move |ctx: CallContext, (): ()| async move {
                    Ok::<_, MethodError>((format!("{label}:{}", ctx.path),))
                },
            )?,
        )
        .build())
}

/// Many concurrent calls on one connection each receive exactly their own reply.
#[tokio::test]
async fn test_concurrent_calls_receive_their_own_replies() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    server.export("/org/example/Echo", echo_object()?)?;

    let proxy = client.proxy(None, "/org/example/Echo", "org.example.Echo")?;
    let mut calls = Vec::new();
    for n in 0..64 {
        let proxy = proxy.clone();
        calls.push(tokio::spawn(async move {
            let text = format!("message-{n}");
            let reply: String = proxy.call_typed("Echo", (text.clone(),)).await?;
            Ok::<_, BusError>((text, reply))
        }));
    }
    for call in calls {
        let (sent, received) = call.await??;
        assert_eq!(sent, received);
    }
    Ok(())
}

/// Fallbacks serve every path below their prefix; the longest prefix wins
/// and exact exports take precedence.
#[tokio::test]
async fn test_fallback_dispatch_prefers_longest_prefix() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    server.add_fallback("/org/example", labelled("outer")?)?;
    server.add_fallback("/org/example/inner", labelled("inner")?)?;
    server.export("/org/example/inner/exact", labelled("exact")?)?;

    let which = |path: &'static str| {
        let client = client.clone();
        async move {
            client
                .proxy(None, path, "org.example.Tree")?
                .call_typed::<_, String>("Which", ())
                .await
        }
    };

    assert_eq!(which("/org/example/a").await?, "outer:/org/example/a");
    assert_eq!(
        which("/org/example/inner/b/c").await?,
        "inner:/org/example/inner/b/c"
    );
    assert_eq!(
        which("/org/example/inner/exact").await?,
        "exact:/org/example/inner/exact"
    );
    assert!(matches!(
        which("/org/other").await,
        Err(BusError::UnknownObject(_))
    ));

    assert!(server.remove_fallback("/org/example/inner")?);
    assert_eq!(
        which("/org/example/inner/b").await?,
        "outer:/org/example/inner/b"
    );
    Ok(())
}

/// Calls that cannot be dispatched are answered with the matching error.
#[tokio::test]
async fn test_dispatch_misses_are_reported() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    server.export("/org/example/Echo", echo_object()?)?;

    let proxy = client.proxy(None, "/org/example/Echo", "org.example.Echo")?;
    let missing = proxy.call("Missing", Vec::new()).await;
    assert!(matches!(missing, Err(BusError::UnknownMethod(_))));

    let wrong_types = proxy.call("Echo", vec![Value::Int32(5)]).await;
    assert!(matches!(wrong_types, Err(BusError::UnknownMethod(_))));

    let elsewhere = client.proxy(None, "/org/example/Nothing", "org.example.Echo")?;
    let unknown = elsewhere.call("Echo", vec![Value::String("x".into())]).await;
    match unknown {
        Err(BusError::UnknownObject(message)) => assert!(message.contains("/org/example/Nothing")),
        other => panic!("expected UnknownObject, got {other:?}"),
    }
    Ok(())
}

/// Well-formed fault names reach the caller verbatim; anything else is
/// reported as a generic failure naming the method.
#[tokio::test]
async fn test_method_faults_are_propagated() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let calculator = ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Calculator")?
                .typed_method("Divide", |_ctx, (a, b): (i32, i32)| async move {
                    if b == 0 {
                        return Err(MethodError::new(
                            "org.example.Calculator.DivideByZero",
                            "division by zero",
                        ));
                    }
                    Ok((a / b,))
                })?
                .typed_method("Broken", |_ctx, (): ()| async move {
                    Err::<(), _>(MethodError::new("not a valid name", "bad things"))
                })?,
        )
        .build();
    server.export("/calc", calculator)?;
    let proxy = client.proxy(None, "/calc", "org.example.Calculator")?;

    let quotient: i32 = proxy.call_typed("Divide", (10_i32, 2_i32)).await?;
    assert_eq!(quotient, 5);

    match proxy.call_typed::<_, i32>("Divide", (1_i32, 0_i32)).await {
        Err(BusError::Execution { name, message }) => {
            assert_eq!(name, "org.example.Calculator.DivideByZero");
            assert_eq!(message, "division by zero");
        }
        other => panic!("expected a named fault, got {other:?}"),
    }

    match proxy.call_typed::<_, ()>("Broken", ()).await {
        Err(BusError::Execution { name, message }) => {
            assert_eq!(name, FAILED);
            assert_eq!(
                message,
                "Error Executing Method org.example.Calculator.Broken: bad things"
            );
        }
        other => panic!("expected a generic failure, got {other:?}"),
    }
    Ok(())
}

/// A panicking handler is answered with a failure and the connection keeps serving.
#[tokio::test]
async fn test_panicking_handler_is_contained() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let fragile = ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Fragile")?
                .typed_method("Explode", |_ctx, (): ()| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, MethodError>(())
                })?,
        )
        .build();
    server.export("/fragile", fragile)?;
    server.export("/echo", echo_object()?)?;

    let explode = client
        .proxy(None, "/fragile", "org.example.Fragile")?
        .call("Explode", Vec::new())
        .await;
    match explode {
        Err(BusError::Execution { name, message }) => {
            assert_eq!(name, FAILED);
            assert!(message.contains("boom"), "unexpected message: {message}");
        }
        other => panic!("expected a failure, got {other:?}"),
    }

    let echoed: String = client
        .proxy(None, "/echo", "org.example.Echo")?
        .call_typed("Echo", ("still alive",))
        .await?;
    assert_eq!(echoed, "still alive");
    Ok(())
}

/// Calls flagged as not expecting a reply still run but are never answered.
#[tokio::test]
async fn test_no_reply_calls_run_without_reply() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let sink = ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Sink")?.typed_method(
                "Put",
                move |_ctx, (item,): (String,)| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(item);
                        Ok::<_, MethodError>(())
                    }
                },
            )?,
        )
        .build();
    server.export("/sink", sink)?;

    client
        .proxy(None, "/sink", "org.example.Sink")?
        .call_no_reply("Put", vec![Value::String("item".into())])?;
    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(received.as_deref(), Some("item"));

    client.bus().ping().await?;
    assert!(client.take_error().is_none());
    Ok(())
}

/// Introspection lists the interfaces of an object and the children of a node.
#[tokio::test]
async fn test_introspection_describes_tree() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    server.export("/org/example/Echo", echo_object()?)?;

    let introspect = |path: &'static str| {
        let client = client.clone();
        async move {
            client
                .proxy(None, path, "org.freedesktop.DBus.Introspectable")?
                .call_typed::<_, String>("Introspect", ())
                .await
        }
    };

    let object = introspect("/org/example/Echo").await?;
    assert!(object.contains("<interface name=\"org.example.Echo\">"));
    assert!(object.contains("<method name=\"Echo\">"));
    assert!(object.contains("<interface name=\"org.freedesktop.DBus.Peer\">"));

    let parent = introspect("/org").await?;
    assert!(parent.contains("<node name=\"example\"/>"));
    assert!(!parent.contains("org.example.Echo"));

    assert!(matches!(
        introspect("/elsewhere").await,
        Err(BusError::UnknownObject(_))
    ));
    Ok(())
}

/// Exporting twice at one path is refused; a dropped lease frees the path.
#[tokio::test]
async fn test_export_lease_releases_path() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let lease = server.export_leased("/leased", echo_object()?)?;
    assert_eq!(lease.path().as_str(), "/leased");
    assert!(matches!(
        server.export("/leased", echo_object()?),
        Err(BusError::AlreadyExported(_))
    ));

    let proxy = client.proxy(None, "/leased", "org.example.Echo")?;
    let reply: String = proxy.call_typed("Echo", ("hello",)).await?;
    assert_eq!(reply, "hello");

    drop(lease);
    assert!(matches!(
        proxy.call_typed::<_, String>("Echo", ("hello",)).await,
        Err(BusError::UnknownObject(_))
    ));
    server.export("/leased", echo_object()?)?;
    Ok(())
}

/// A lease dropped after its path was re-exported leaves the new object in place.
#[tokio::test]
async fn test_stale_lease_keeps_reexported_object() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let lease = server.export_leased("/leased", echo_object()?)?;
    assert!(server.unexport("/leased")?);
    server.export("/leased", echo_object()?)?;

    drop(lease);
    let proxy = client.proxy(None, "/leased", "org.example.Echo")?;
    let reply: String = proxy.call_typed("Echo", ("still here",)).await?;
    assert_eq!(reply, "still here");
    Ok(())
}
