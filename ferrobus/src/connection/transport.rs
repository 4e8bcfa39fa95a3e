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

//! Byte streams carrying a connection and the authentication seam.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use ferrobus_core::{BusAddress, BusError, Endpoint};

/// Any bidirectional byte stream a connection can run on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Authentication performed on a fresh transport before messages flow.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Authenticate `stream` and hand it back ready for message traffic.
    async fn authenticate(&self, stream: BoxedTransport) -> Result<BoxedTransport, BusError>;
}

/// Handshake for streams that are already trusted, such as socket pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreAuthenticated;

#[async_trait]
impl Handshake for PreAuthenticated {
    async fn authenticate(&self, stream: BoxedTransport) -> Result<BoxedTransport, BusError> {
        Ok(stream)
    }
}

/// Open a stream to one endpoint.
pub(crate) async fn open(endpoint: &Endpoint) -> Result<BoxedTransport, BusError> {
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}

/// Open a stream to the first reachable address.
pub(crate) async fn open_first(addresses: &[BusAddress]) -> Result<BoxedTransport, BusError> {
    let mut last_error = BusError::NotConnected;
    for address in addresses {
        match address.endpoint() {
            Ok(endpoint) => match open(&endpoint).await {
                Ok(stream) => {
                    debug!(%address, "transport opened");
                    return Ok(stream);
                }
                Err(error) => {
                    warn!(%address, %error, "could not reach bus address");
                    last_error = error;
                }
            },
            Err(error) => {
                warn!(%address, %error, "unusable bus address");
                last_error = error;
            }
        }
    }
    Err(last_error)
}
