// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-oriented TCP location feed with automatic reconnection.
//!
//! Connects to a GPS bridge (gpsd NMEA relay, phone GPS-to-TCP app, ...) and
//! turns each line into a [`Fix`]. Lost connections are retried after
//! `reconnect_delay` until the watch is cancelled.

use std::io;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::{parse_line, Fix, LineError, LocationError, LocationSource, WatchOptions};

/// Configuration for a TCP location feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Feed address in "host:port" format.
    pub address: String,
    /// Delay before reconnecting after a disconnect.
    pub reconnect_delay: Duration,
    /// Channel buffer size for parsed fixes.
    pub buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            address: "localhost:2947".to_string(),
            reconnect_delay: Duration::from_secs(5),
            buffer_size: 64,
        }
    }
}

/// [`LocationSource`] reading NMEA or CSV lines from a TCP socket.
#[derive(Debug, Clone)]
pub struct FeedSource {
    config: FeedConfig,
}

impl FeedSource {
    #[must_use]
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

impl LocationSource for FeedSource {
    fn watch(
        &self,
        options: WatchOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Fix, LocationError>> {
        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let config = self.config.clone();
        tokio::spawn(async move {
            feed_loop(config, options, tx, cancel).await;
        });
        rx
    }
}

type FixSender = mpsc::Sender<Result<Fix, LocationError>>;

enum Disconnect {
    Closed,
    Cancelled,
}

async fn feed_loop(
    config: FeedConfig,
    options: WatchOptions,
    tx: FixSender,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        info!("Connecting to location feed {}...", config.address);

        match connect_and_read(&config.address, options, &tx, &cancel).await {
            Ok(Disconnect::Cancelled) => {
                info!("Location feed cancelled");
                return;
            }
            Ok(Disconnect::Closed) => {
                info!("Location feed closed by server");
                if tx
                    .send(Err(LocationError::PositionUnavailable(
                        "location feed closed".to_string(),
                    )))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                error!("Location feed error: {}", e);
                let mapped = match e.kind() {
                    io::ErrorKind::PermissionDenied => LocationError::PermissionDenied,
                    _ => LocationError::PositionUnavailable(e.to_string()),
                };
                if tx.send(Err(mapped)).await.is_err() {
                    return;
                }
            }
        }

        warn!("Reconnecting in {} seconds...", config.reconnect_delay.as_secs());

        tokio::select! {
            () = sleep(config.reconnect_delay) => {}
            () = cancel.cancelled() => return,
        }
    }
}

async fn connect_and_read(
    address: &str,
    options: WatchOptions,
    tx: &FixSender,
    cancel: &CancellationToken,
) -> io::Result<Disconnect> {
    let stream = tokio::select! {
        stream = TcpStream::connect(address) => stream?,
        () = cancel.cancelled() => return Ok(Disconnect::Cancelled),
    };
    info!("Connected to location feed {}", address);

    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = tokio::select! {
            result = timeout(options.timeout, lines.next_line()) => match result {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(Disconnect::Closed),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if tx.send(Err(LocationError::Timeout(options.timeout))).await.is_err() {
                        return Ok(Disconnect::Cancelled);
                    }
                    continue;
                }
            },
            () = cancel.cancelled() => return Ok(Disconnect::Cancelled),
        };

        let received_at = Utc::now();
        let item = match parse_line(&line, received_at) {
            Ok(Some(fix)) => {
                let age = (received_at - fix.timestamp).to_std().unwrap_or_default();
                if age > options.max_stale {
                    debug!("Dropping stale fix ({:?} old)", age);
                    continue;
                }
                Ok(fix)
            }
            Ok(None) => continue,
            Err(LineError::NoFix) => {
                Err(LocationError::PositionUnavailable("receiver has no fix".to_string()))
            }
            Err(e) => {
                warn!("Skipping unparseable feed line '{}': {}", line, e);
                continue;
            }
        };

        if tx.send(item).await.is_err() {
            return Ok(Disconnect::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn options() -> WatchOptions {
        WatchOptions::from_millis(true, 20_000, 60_000)
    }

    #[tokio::test]
    async fn test_feed_delivers_fixes_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"25.0330,121.5654,5\nnot a fix\n$GPGGA,123519,,,,,0,00,,,M,,M,,\n25.0340,121.5654\n")
                .await
                .unwrap();
            // Keep the socket open until the test finishes reading.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let source = FeedSource::new(FeedConfig {
            address,
            ..FeedConfig::default()
        });
        let cancel = CancellationToken::new();
        let mut rx = source.watch(options(), cancel.clone());

        let first = rx.recv().await.unwrap().unwrap();
        assert!((first.lat - 25.0330).abs() < 1e-9);
        assert_eq!(first.accuracy, Some(5.0));

        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(LocationError::PositionUnavailable(_))
        ));

        let second = rx.recv().await.unwrap().unwrap();
        assert!((second.lat - 25.0340).abs() < 1e-9);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_fix_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Epoch-era timestamp is always older than max_stale.
            socket.write_all(b"1.0,1.0,,,1000\n2.0,2.0\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let source = FeedSource::new(FeedConfig {
            address,
            ..FeedConfig::default()
        });
        let cancel = CancellationToken::new();
        let mut rx = source.watch(options(), cancel.clone());

        let fix = rx.recv().await.unwrap().unwrap();
        assert!((fix.lat - 2.0).abs() < f64::EPSILON);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_refused_reported_as_unavailable() {
        // Bind then drop to get a port with nothing listening.
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let source = FeedSource::new(FeedConfig {
            address,
            reconnect_delay: Duration::from_secs(60),
            ..FeedConfig::default()
        });
        let cancel = CancellationToken::new();
        let mut rx = source.watch(options(), cancel.clone());

        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(LocationError::PositionUnavailable(_))
        ));
        cancel.cancel();
    }
}
