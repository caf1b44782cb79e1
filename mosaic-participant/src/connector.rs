//! Reconnecting connection to the coordinator.
//!
//! The participant never initiates protocol traffic; it connects to the
//! coordinator, identifies itself with a [`Hello`] frame, then serves
//! inbound messages until the connection drops. Reconnection uses jittered
//! exponential backoff so Phase II retries keep reaching this node across
//! coordinator restarts.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use mosaic_core::{Envelope, Hello, HelloAck, PostcardCodec, WireError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::config::BackoffConfig;
use crate::node::Participant;
use crate::oracle::Oracle;

/// Connect to the coordinator and serve messages forever.
///
/// # Errors
///
/// Returns an error only if the coordinator rejects this node's handshake;
/// transport failures are retried with backoff.
#[instrument(skip_all, fields(node = %node.id(), coordinator = %coordinator))]
pub async fn run<O: Oracle>(
    node: Arc<Participant<O>>,
    coordinator: SocketAddr,
    backoff: BackoffConfig,
) -> Result<(), WireError> {
    let mut rng = StdRng::from_os_rng();
    let mut retries = 0u32;

    loop {
        match TcpStream::connect(coordinator).await {
            Ok(stream) => {
                retries = 0;
                match session(&node, stream).await {
                    Ok(()) => info!("coordinator closed the connection"),
                    Err(e @ WireError::Handshake(_)) => return Err(e),
                    Err(e) => warn!(error = %e, "connection lost"),
                }
            }
            Err(e) => debug!(error = %e, "connect failed"),
        }

        retries = retries.saturating_add(1);
        tokio::time::sleep(backoff.duration(retries, &mut rng)).await;
    }
}

/// One connection's lifetime: handshake, then the delivery loop.
async fn session<O: Oracle>(
    node: &Arc<Participant<O>>,
    stream: TcpStream,
) -> Result<(), WireError> {
    let (read_half, write_half) = stream.into_split();

    let mut writer = FramedWrite::new(write_half, PostcardCodec::<Hello>::new());
    writer
        .send(Hello {
            node: node.id().clone(),
        })
        .await?;

    let mut reader = FramedRead::new(read_half, PostcardCodec::<HelloAck>::new());
    let ack = reader
        .next()
        .await
        .ok_or_else(|| WireError::Connect("closed before handshake ack".to_owned()))??;
    match ack {
        HelloAck::Ok => {}
        HelloAck::Rejected(reason) => return Err(WireError::Handshake(reason)),
    }
    debug!("registered with coordinator");

    // Same framing, envelope payloads from here on. `map_decoder` keeps
    // any bytes already buffered past the handshake frame.
    let mut reader = reader.map_decoder(|_| PostcardCodec::<Envelope>::new());
    let mut writer = FramedWrite::new(writer.into_inner(), PostcardCodec::<Envelope>::new());

    while let Some(frame) = reader.next().await {
        let env = match frame {
            Ok(env) => env,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        node.wait_recovered().await;
        match node.handle(env).await {
            Ok(Some(reply)) => writer.send(reply).await?,
            Ok(None) => {}
            // The missed reply surfaces on the coordinator as a vote or
            // ack timeout; Phase II retries re-run the handler.
            Err(e) => error!(error = %e, "handler failed, reply withheld"),
        }
    }
    Ok(())
}
