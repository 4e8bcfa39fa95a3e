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

use std::time::{Duration, Instant};

use ferrobus::prelude::*;
use ferrobus_core::names::LOCAL_INTERFACE;
use tokio::sync::mpsc;

mod setup;

use crate::setup::*;

/// Signals reach handlers whose key selects them, and only those.
#[tokio::test]
async fn test_signal_handlers_receive_matching_signals() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let key = SignalKey::new("org.example.Sensor", "Changed")?.with_path(ObjectPath::new("/sensor")?);
    let id = client
        .add_signal_handler(key, move |signal| {
            let _ = tx.send(signal.into_body());
        })
        .await?;

    server.emit_signal("/other", "org.example.Sensor", "Changed", vec![Value::Int32(1)])?;
    server.emit_signal("/sensor", "org.example.Sensor", "Renamed", vec![Value::Int32(2)])?;
    server.emit_signal("/sensor", "org.example.Sensor", "Changed", vec![Value::Int32(3)])?;

    let body = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(body, Some(vec![Value::Int32(3)]));

    assert!(client.remove_signal_handler(id).await?);
    assert!(!client.remove_signal_handler(id).await?);
    Ok(())
}

/// Handler keys may only filter on unique sender names.
#[tokio::test]
async fn test_signal_keys_require_unique_sources() -> anyhow::Result<()> {
    initialize_tracing();
    let key = SignalKey::new("org.example.Sensor", "Changed")?;
    assert!(key.clone().with_source(":1.7").is_ok());
    assert!(matches!(
        key.with_source("org.example.Owner"),
        Err(BusError::InvalidArgs(_))
    ));
    Ok(())
}

/// When the peer goes away, awaited calls fail promptly instead of timing out.
#[tokio::test]
async fn test_peer_disconnect_fails_outstanding_calls() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let stalled = ObjectBuilder::new()
        .interface(
            InterfaceBuilder::new("org.example.Stall")?
                .typed_method("Wait", |_ctx, (): ()| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, MethodError>(())
                })?,
        )
        .build();
    server.export("/stall", stalled)?;

    let proxy = client.proxy(None, "/stall", "org.example.Stall")?;
    let started = Instant::now();
    let call = tokio::spawn(async move { proxy.call("Wait", Vec::new()).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.disconnect();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call).await??;
    assert!(matches!(outcome, Err(BusError::Disconnected)));
    assert!(started.elapsed() < client.config().call_timeout());

    client.wait_closed().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

/// Closing a connection locally fails callback calls through their error callback.
#[tokio::test]
async fn test_local_disconnect_runs_error_callbacks() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, _server) = connected_pair().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let call = Message::method_call("/nowhere", "Wait")?
        .interface("org.example.Stall")?
        .build()?;
    let on_error = tx.clone();
    client.call_with_callback(
        call,
        move |_reply| {
            let _ = tx.send(None);
        },
        move |error| {
            let _ = on_error.send(Some(error));
        },
    )?;
    client.disconnect();

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert!(matches!(outcome, Some(Some(BusError::Disconnected))));
    Ok(())
}

/// The local `Disconnected` signal is delivered when the transport closes.
#[tokio::test]
async fn test_disconnected_signal_is_delivered() -> anyhow::Result<()> {
    initialize_tracing();
    let (client, server) = connected_pair().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .add_signal_handler(SignalKey::new(LOCAL_INTERFACE, "Disconnected")?, move |signal| {
            let _ = tx.send(signal.member().map(str::to_string));
        })
        .await?;

    drop(server);

    let member = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(member, Some(Some("Disconnected".to_string())));
    assert!(!client.is_connected());
    Ok(())
}
