//! TCP connection gauge for the Ollama server running on this host.
//!
//! Counts sockets bound to the local Ollama port from `/proc/net/tcp` and
//! `/proc/net/tcp6`. New connections are approximated by increases in the
//! established count between two samples.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Serialize;

const TCP_ESTABLISHED: &str = "01";
const TCP_LISTEN: &str = "0A";

/// Latest socket counts for the watched port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalSample {
    pub established: u64,
    pub listening: bool,
    pub new_connections_total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sample: LocalSample,
    available: bool,
}

pub struct LocalConnections {
    port: u16,
    node_name: String,
    tables: Vec<PathBuf>,
    counters: Mutex<Counters>,
}

impl LocalConnections {
    pub fn new(port: u16, node_name: impl Into<String>) -> Self {
        Self::with_tables(
            port,
            node_name,
            vec![PathBuf::from("/proc/net/tcp"), PathBuf::from("/proc/net/tcp6")],
        )
    }

    /// Read socket tables from custom locations.
    pub fn with_tables(port: u16, node_name: impl Into<String>, tables: Vec<PathBuf>) -> Self {
        Self {
            port,
            node_name: node_name.into(),
            tables,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Re-read the socket tables.
    ///
    /// When no table can be read the gauge is marked unavailable and the
    /// previous counts are left alone.
    pub async fn refresh(&self) {
        let mut established = 0;
        let mut listen = 0;
        let mut read_any = false;

        for table in &self.tables {
            match tokio::fs::read_to_string(table).await {
                Ok(content) => {
                    read_any = true;
                    let (est, lis) = count_sockets(&content, self.port);
                    established += est;
                    listen += lis;
                }
                Err(e) => tracing::debug!("Cannot read {}: {}", table.display(), e),
            }
        }

        let mut counters = self.counters.lock();
        if !read_any {
            if counters.available {
                tracing::warn!("Socket tables unreadable, local connection gauge disabled");
            }
            counters.available = false;
            return;
        }

        let previous = counters.sample.established;
        if established > previous {
            counters.sample.new_connections_total += established - previous;
        }
        counters.sample.established = established;
        counters.sample.listening = listen > 0;
        counters.available = true;
    }

    /// The latest sample, or `None` if the tables were never readable.
    pub fn sample(&self) -> Option<LocalSample> {
        let counters = self.counters.lock();
        counters.available.then_some(counters.sample)
    }
}

/// Count (established, listening) sockets whose local port is `port`.
fn count_sockets(table: &str, port: u16) -> (u64, u64) {
    let mut established = 0;
    let mut listen = 0;

    // First line is the column header.
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(_slot), Some(local), Some(_remote), Some(state)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let local_port = local
            .rsplit_once(':')
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
        if local_port != Some(port) {
            continue;
        }

        if state.eq_ignore_ascii_case(TCP_ESTABLISHED) {
            established += 1;
        } else if state.eq_ignore_ascii_case(TCP_LISTEN) {
            listen += 1;
        }
    }

    (established, listen)
}
