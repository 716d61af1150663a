// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection

use tokio::signal::ctrl_c;

/// Future that resolves when a graceful shutdown has been requested.
///
/// Detects a `SIGINT`.
///
/// **BEWARE:** This alters process state by _permanently_ registering an interrupt handler
/// through [`tokio`], so it belongs near the entry point of a program.
pub async fn graceful_shutdown_requested() -> std::io::Result<()> {
    ctrl_c().await
}

/// Future that resolves when a fast shutdown has been requested.
///
/// Things that constitute a request for a fast shutdown:
///
/// * Two `SIGINT`s
/// * At least one `SIGTERM`
///
/// **BEWARE:** This alters process state by _permanently_ registering an interrupt handler
/// through [`tokio`], so it belongs near the entry point of a program.
pub async fn fast_shutdown_requested() -> std::io::Result<()> {
    let second_interrupt = async {
        ctrl_c().await?;
        ctrl_c().await
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = second_interrupt => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    second_interrupt.await
}

// Signal handlers are process-global and permanent, so these are exercised by hand
// (`kill -INT`/`kill -TERM` against a running checksigd) rather than by unit tests.
