// aqlink Collector - operator signals
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Operator signals.
//!
//! | Signal  | Action                               |
//! |---------|--------------------------------------|
//! | SIGUSR1 | log the kit cache status             |
//! | SIGHUP  | invalidate the cache, reload the store |
//! | SIGINT / SIGTERM | stop                        |

use std::io;

/// What the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    DumpStatus,
    Invalidate,
    Shutdown,
}

#[cfg(unix)]
pub struct Signals {
    usr1: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            usr1: signal(SignalKind::user_defined1())?,
            hup: signal(SignalKind::hangup())?,
            term: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal
    pub async fn recv(&mut self) -> Control {
        tokio::select! {
            _ = self.usr1.recv() => Control::DumpStatus,
            _ = self.hup.recv() => Control::Invalidate,
            _ = self.term.recv() => Control::Shutdown,
            _ = tokio::signal::ctrl_c() => Control::Shutdown,
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn install() -> io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Shutdown
    }
}
