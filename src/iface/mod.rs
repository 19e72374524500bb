use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

/// Default sysfs root for per-interface statistics.
pub const SYS_NET_ROOT: &str = "/sys/class/net";

const RX_STAT: &str = "statistics/rx_bytes";
const TX_STAT: &str = "statistics/tx_bytes";

/// Counter files are a decimal integer plus newline; 64 bytes covers any
/// u64 with room to detect trailing garbage.
const READ_BUF_SIZE: usize = 64;

/// Errors from the interface counter source.
#[derive(Debug, Error)]
pub enum IfaceError {
    /// The counter files for the interface cannot be opened.
    #[error("interface is invalid")]
    InvalidInterface,
    /// Operation on an explicitly closed sampler.
    #[error("interface is closed")]
    Closed,
    /// The counter files are already open.
    #[error("interface is already open")]
    AlreadyOpen,
    /// A counter file refused to seek back to offset 0.
    #[error("failed to seek stat file")]
    FailedSeek,
    /// A counter file did not contain a newline-terminated decimal integer.
    #[error("invalid data in stat file")]
    InvalidData,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Counters {
    rx: File,
    tx: File,
}

struct IfaceState {
    counters: Option<Counters>,
    last_send: u64,
    last_recv: u64,
    open: bool,
}

/// A sampler over one network interface's cumulative byte counters.
///
/// Reads are converted into deltas since the previous successful call.
/// Counter failures detach the sampler (zero deltas, no error) and the next
/// call attempts to reopen, so an interface can disappear and return without
/// killing the monitor. The first read after an attach reports zero so a
/// counter reset never shows up as a spike.
pub struct Iface {
    name: String,
    alias: Option<String>,
    root: PathBuf,
    state: Mutex<IfaceState>,
}

impl Iface {
    /// Create a sampler over the default sysfs root.
    pub fn new(name: impl Into<String>, alias: Option<String>) -> Self {
        Self::with_root(SYS_NET_ROOT, name, alias)
    }

    /// Create a sampler over an alternate statistics root.
    pub fn with_root(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        alias: Option<String>,
    ) -> Self {
        let iface = Self {
            name: name.into(),
            alias,
            root: root.into(),
            state: Mutex::new(IfaceState {
                counters: None,
                last_send: 0,
                last_recv: 0,
                open: true,
            }),
        };

        {
            let mut st = iface.state.lock();
            if let Err(e) = attach(&iface.root, &iface.name, &mut st) {
                warn!(iface = %iface.name, error = %e, "failed to open interface, will keep trying");
            }
        }

        iface
    }

    /// Raw interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display name: the alias when set and non-empty, else the raw name.
    pub fn display_name(&self) -> &str {
        match self.alias.as_deref() {
            Some(alias) if !alias.is_empty() => alias,
            _ => &self.name,
        }
    }

    /// Bytes sent and received since the previous successful call.
    ///
    /// Counter errors are absorbed: the sampler detaches, both history
    /// fields reset, and `(0, 0)` is returned. A detached sampler attempts
    /// to reopen on every call.
    pub fn get_stats(&self) -> (u64, u64) {
        let mut st = self.state.lock();

        if st.counters.is_none() && attach(&self.root, &self.name, &mut st).is_err() {
            return (0, 0);
        }

        let read = match st.counters.as_mut() {
            Some(counters) => read_counter(&mut counters.rx)
                .and_then(|rx| read_counter(&mut counters.tx).map(|tx| (rx, tx))),
            None => return (0, 0),
        };

        let (rx, tx) = match read {
            Ok(v) => v,
            Err(e) => {
                warn!(iface = %self.name, error = %e, "counter read failed, detaching");
                detach(&mut st);
                return (0, 0);
            }
        };

        let mut send_delta = tx.wrapping_sub(st.last_send);
        let mut recv_delta = rx.wrapping_sub(st.last_recv);
        if st.last_send == 0 {
            send_delta = 0;
        }
        if st.last_recv == 0 {
            recv_delta = 0;
        }

        st.last_send = tx;
        st.last_recv = rx;

        (send_delta, recv_delta)
    }

    /// Release the counter handles. Calling close twice is an error.
    pub fn close(&self) -> Result<(), IfaceError> {
        let mut st = self.state.lock();
        if !st.open {
            return Err(IfaceError::Closed);
        }
        st.counters = None;
        st.open = false;
        Ok(())
    }
}

/// Open both counter files. Caller must hold the state lock.
fn attach(root: &Path, name: &str, st: &mut IfaceState) -> Result<(), IfaceError> {
    if st.counters.is_some() {
        return Err(IfaceError::AlreadyOpen);
    }

    let base = root.join(name);
    let rx = File::open(base.join(RX_STAT)).map_err(|_| IfaceError::InvalidInterface)?;
    let tx = File::open(base.join(TX_STAT)).map_err(|_| IfaceError::InvalidInterface)?;

    st.counters = Some(Counters { rx, tx });
    Ok(())
}

/// Drop the counter handles and zero the delta history so the next
/// successful read reports zero instead of a spurious spike.
fn detach(st: &mut IfaceState) {
    st.counters = None;
    st.last_send = 0;
    st.last_recv = 0;
}

fn read_counter(file: &mut File) -> Result<u64, IfaceError> {
    let pos = file.seek(SeekFrom::Start(0))?;
    if pos != 0 {
        return Err(IfaceError::FailedSeek);
    }

    let mut buf = [0u8; READ_BUF_SIZE];
    let n = file.read(&mut buf)?;
    if n < 2 || buf[n - 1] != b'\n' {
        return Err(IfaceError::InvalidData);
    }

    let text = std::str::from_utf8(&buf[..n - 1]).map_err(|_| IfaceError::InvalidData)?;
    text.parse::<u64>().map_err(|_| IfaceError::InvalidData)
}
