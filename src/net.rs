//! Replicated command transport
//!
//! Calibration edits cross the wire as a small typed command enum, one JSON
//! line per command, over plain TCP. The authority is the sole publisher: a
//! single fan-out task serializes each command once and writes it to every
//! subscriber in turn, so per-subscriber ordering is exactly the authority's
//! local apply order. Replicas only ever receive. There are no retries or
//! acknowledgements; delivery is assumed reliable and ordered (TCP), and a
//! lost subscriber is simply dropped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::replicator::CalibrationMode;

/// Everything that crosses the wire. Scalars only; mesh data never leaves
/// the node that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum CalibrationCommand {
    Shift {
        direction: [f32; 3],
        delta: f32,
        selection_index: usize,
        vertex_index: usize,
    },
    MovePosition {
        direction: [f32; 3],
        delta: f32,
        selection_index: usize,
    },
    Rotate {
        direction: [f32; 3],
        delta: f32,
        selection_index: usize,
    },
    SetMode {
        mode: CalibrationMode,
    },
    SetLastIndex {
        index: usize,
    },
    AdjustGridSelectSize {
        increase: bool,
    },
    FocusInfoDisplay {
        index: usize,
    },
}

/// Where the replicator hands commands off for delivery to peers.
pub trait CommandPublisher: Send {
    fn publish(&mut self, command: CalibrationCommand);
}

/// Publisher for replica nodes and tests: replicas never originate edits.
pub struct NullPublisher;

impl CommandPublisher for NullPublisher {
    fn publish(&mut self, _command: CalibrationCommand) {}
}

/// Authority-side publisher backed by a TCP fan-out task.
pub struct BroadcastPublisher {
    tx: mpsc::UnboundedSender<CalibrationCommand>,
    local_addr: SocketAddr,
}

impl BroadcastPublisher {
    /// Bind the subscription endpoint and start the fan-out task.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind command broadcast on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("Broadcasting calibration commands on {}", local_addr);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(fan_out(listener, rx));

        Ok(Self { tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl CommandPublisher for BroadcastPublisher {
    fn publish(&mut self, command: CalibrationCommand) {
        if self.tx.send(command).is_err() {
            warn!("Command fan-out task is gone; edit not replicated");
        }
    }
}

async fn fan_out(
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<CalibrationCommand>,
) {
    let mut subscribers: Vec<(SocketAddr, TcpStream)> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("Replica subscribed from {}", peer);
                        subscribers.push((peer, stream));
                    }
                    Err(e) => warn!("Failed to accept replica connection: {}", e),
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                let line = match serde_json::to_string(&command) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    Err(e) => {
                        warn!("Failed to encode command: {}", e);
                        continue;
                    }
                };

                let mut alive = Vec::with_capacity(subscribers.len());
                for (peer, mut stream) in subscribers.drain(..) {
                    match stream.write_all(line.as_bytes()).await {
                        Ok(()) => alive.push((peer, stream)),
                        Err(e) => info!("Dropping replica {}: {}", peer, e),
                    }
                }
                subscribers = alive;
            }
        }
    }
    debug!("Command fan-out task finished");
}

/// Subscribe to the authority's command stream. Returns a receiver that
/// yields commands in publish order; the channel closes when the authority
/// disconnects.
pub async fn subscribe(addr: &str) -> Result<mpsc::UnboundedReceiver<CalibrationCommand>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to reach authority at {}", addr))?;
    info!("Subscribed to calibration commands from {}", addr);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(read_commands(stream, tx));
    Ok(rx)
}

async fn read_commands(stream: TcpStream, tx: mpsc::UnboundedSender<CalibrationCommand>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CalibrationCommand>(&line) {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed command line: {}", e),
                }
            }
            Ok(None) => {
                info!("Authority closed the command stream");
                break;
            }
            Err(e) => {
                warn!("Command stream read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_command_json_round_trip() {
        let commands = vec![
            CalibrationCommand::Shift {
                direction: [1.0, 0.0, 0.0],
                delta: 0.0015,
                selection_index: 2,
                vertex_index: 36,
            },
            CalibrationCommand::SetMode {
                mode: CalibrationMode::Rotation,
            },
            CalibrationCommand::AdjustGridSelectSize { increase: false },
        ];
        for command in commands {
            let line = serde_json::to_string(&command).unwrap();
            let parsed: CalibrationCommand = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed, command);
        }
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let line = serde_json::to_string(&CalibrationCommand::SetLastIndex { index: 3 }).unwrap();
        assert!(line.contains("\"cmd\":\"set_last_index\""));
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let mut publisher = BroadcastPublisher::bind("127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();

        let mut commands = subscribe(&addr).await.unwrap();
        // let the fan-out task accept the subscription before publishing
        tokio::time::sleep(Duration::from_millis(100)).await;

        for index in 0..10 {
            publisher.publish(CalibrationCommand::SetLastIndex { index });
        }

        for expected in 0..10 {
            let command = tokio::time::timeout(Duration::from_secs(2), commands.recv())
                .await
                .expect("timed out waiting for command")
                .expect("stream closed early");
            assert_eq!(command, CalibrationCommand::SetLastIndex { index: expected });
        }
    }
}
