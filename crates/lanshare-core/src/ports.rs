//! Chunk port negotiation.
//!
//! After the receiver signals `READY` for a file, the sender proposes one
//! port per chunk (`transfer_port + 1 + index`) as a single versioned map
//! on the metadata channel. The receiver tries to bind each proposed port,
//! substitutes a random port from the dynamic range where the proposal is
//! taken, and replies with the final map taken from the ports it actually
//! bound. The sender acknowledges the final map with one byte before any
//! chunk connection is opened, so every listener exists before the first
//! connect.

use std::collections::BTreeMap;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{self, PORT_MAP_ACK};
use crate::MAX_PORT_ATTEMPTS;

/// The bound per-chunk listeners on the receiving side.
#[derive(Debug)]
pub struct ChunkListeners {
    listeners: BTreeMap<u32, TcpListener>,
}

impl ChunkListeners {
    /// The final index-to-port map, read from the actual bound ports.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener's local address cannot be read.
    pub fn port_map(&self) -> Result<BTreeMap<u32, u16>> {
        self.listeners
            .iter()
            .map(|(&index, listener)| Ok((index, listener.local_addr()?.port())))
            .collect()
    }

    /// Remove the listener for `index`, handing ownership to a chunk task.
    #[must_use]
    pub fn take(&mut self, index: u32) -> Option<TcpListener> {
        self.listeners.remove(&index)
    }

    /// Number of bound listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether any listeners remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// The sender's proposed port for a chunk.
fn preferred_port(base_port: u16, index: u32) -> Option<u16> {
    base_port
        .checked_add(1)
        .and_then(|p| p.checked_add(u16::try_from(index).ok()?))
}

async fn bind_one(
    index: u32,
    proposed: Option<u16>,
    dynamic_range: (u16, u16),
) -> Result<TcpListener> {
    if let Some(port) = proposed {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            trace!(index, port, "bound proposed chunk port");
            return Ok(listener);
        }
    }

    let (lo, hi) = dynamic_range;
    for _ in 0..MAX_PORT_ATTEMPTS {
        let port = rand::thread_rng().gen_range(lo..hi);
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            trace!(index, port, "bound dynamic chunk port");
            return Ok(listener);
        }
    }

    Err(Error::PortExhausted(index, MAX_PORT_ATTEMPTS))
}

fn check_covers(map: &BTreeMap<u32, u16>, total_chunks: u32) -> Result<()> {
    if map.len() != total_chunks as usize {
        return Err(Error::PortNegotiationFailed(format!(
            "port map has {} entries, expected {total_chunks}",
            map.len()
        )));
    }
    for index in 0..total_chunks {
        if !map.contains_key(&index) {
            return Err(Error::PortNegotiationFailed(format!(
                "port map missing chunk {index}"
            )));
        }
    }
    Ok(())
}

/// Sender side: propose ports for every chunk, take the receiver's final
/// map, and acknowledge it.
///
/// # Errors
///
/// Returns [`Error::PortNegotiationFailed`] if the final map does not
/// cover exactly the chunks `0..total_chunks`.
pub async fn propose_ports<S>(
    stream: &mut S,
    total_chunks: u32,
    base_port: u16,
) -> Result<BTreeMap<u32, u16>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let proposal: BTreeMap<u32, u16> = (0..total_chunks)
        .map(|index| (index, preferred_port(base_port, index).unwrap_or(0)))
        .collect();
    protocol::write_port_map(stream, &proposal).await?;

    let final_map = protocol::read_port_map(stream).await?;
    check_covers(&final_map, total_chunks)?;

    stream.write_u8(PORT_MAP_ACK).await?;
    stream.flush().await?;
    debug!(chunks = final_map.len(), "port map acknowledged");
    Ok(final_map)
}

/// Receiver side: bind a listener per proposed port (falling back to the
/// dynamic range), reply with the final map, and wait for the ack.
///
/// # Errors
///
/// Returns [`Error::PortExhausted`] if a chunk cannot find a free port, or
/// [`Error::PortNegotiationFailed`] on a malformed proposal or ack.
pub async fn answer_proposal<S>(
    stream: &mut S,
    total_chunks: u32,
    dynamic_range: (u16, u16),
) -> Result<ChunkListeners>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let proposal = protocol::read_port_map(stream).await?;
    check_covers(&proposal, total_chunks)?;

    let mut listeners = BTreeMap::new();
    for (&index, &port) in &proposal {
        let proposed = if port == 0 { None } else { Some(port) };
        let listener = bind_one(index, proposed, dynamic_range).await?;
        listeners.insert(index, listener);
    }
    let listeners = ChunkListeners { listeners };

    let final_map = listeners.port_map()?;
    protocol::write_port_map(stream, &final_map).await?;

    let ack = stream.read_u8().await?;
    if ack != PORT_MAP_ACK {
        return Err(Error::PortNegotiationFailed(format!(
            "unexpected ack byte: {ack:#04x}"
        )));
    }
    debug!(total_chunks, "all chunk listeners bound and acknowledged");
    Ok(listeners)
}
