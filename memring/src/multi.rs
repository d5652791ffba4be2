//! Pipelined multi-get coordinator.
//!
//! Groups keys by owning server, writes one batch of quiet gets per group,
//! then drains every participating socket through readiness multiplexing
//! under a single whole-operation deadline (`socket_timeout`). Group-level
//! failures drop that group's keys; a network error mid-drain aborts the
//! whole operation. Results already emitted are the caller's to keep.

use std::collections::HashMap;
use std::time::Instant;

use memring_wire::Response;
use parking_lot::MutexGuard;
use polling::{Event, Events, Poller};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ring::Ring;

fn poll_error(err: std::io::Error) -> Error {
    Error::network("multi-get", err.to_string())
}

fn abort_active(conns: &mut [MutexGuard<'_, Connection>], active: &[bool]) {
    for (i, conn) in conns.iter_mut().enumerate() {
        if active[i] {
            conn.multi_response_abort();
        }
    }
}

/// Fetch `keys` (already normalized) across the ring, invoking `emit` for
/// every hit as it arrives. No cross-server ordering; within one server,
/// responses preserve request order.
pub(crate) fn multi_get(
    ring: &Ring,
    config: &ClientConfig,
    keys: Vec<String>,
    emit: &mut dyn FnMut(&str, Response),
) -> Result<()> {
    // Group keys by owning server; keys with no live owner are dropped.
    let mut groups: HashMap<usize, Vec<String>> = HashMap::new();
    for key in keys {
        match ring.server_for_key(&key) {
            Ok(idx) => groups.entry(idx).or_default().push(key),
            Err(err) => debug!(key = %key, error = %err, "dropping key from multi-get"),
        }
    }
    if groups.is_empty() {
        return Ok(());
    }

    // Multi-key operations hold several sockets; take the ring-wide scope.
    let _scope = ring.multi_guard();

    // Lock each participant and send its batch. A group whose send fails is
    // dropped, not fatal.
    let mut conns: Vec<MutexGuard<'_, Connection>> = Vec::new();
    for (idx, group_keys) in groups {
        let mut conn = ring.connection(idx).lock();
        match conn.send_multiget(&group_keys) {
            Ok(()) => conns.push(conn),
            Err(err) => warn!(
                server = ring.server_name(idx),
                keys = group_keys.len(),
                error = %err,
                "dropping multi-get group"
            ),
        }
    }
    if conns.is_empty() {
        return Ok(());
    }

    // Switch every participant to non-blocking; a failure here is hard.
    for i in 0..conns.len() {
        if let Err(err) = conns[i].multi_response_start() {
            let active = vec![true; conns.len()];
            abort_active(&mut conns, &active);
            return Err(err);
        }
    }

    drain(&mut conns, config, emit)
}

fn drain(
    conns: &mut Vec<MutexGuard<'_, Connection>>,
    config: &ClientConfig,
    emit: &mut dyn FnMut(&str, Response),
) -> Result<()> {
    let mut active = vec![true; conns.len()];
    let mut remaining = conns.len();

    let poller = Poller::new().map_err(|e| {
        abort_active(conns, &active);
        poll_error(e)
    })?;
    for i in 0..conns.len() {
        // The fd exists: send_multiget just succeeded on this connection.
        let Some(fd) = conns[i].registered_fd() else {
            abort_active(conns, &active);
            return Err(Error::Protocol("multi-get connection lost its socket".into()));
        };
        if let Err(e) = unsafe { poller.add(fd, Event::readable(i)) } {
            abort_active(conns, &active);
            return Err(poll_error(e));
        }
    }

    let started = Instant::now();
    let mut events = Events::new();

    while remaining > 0 {
        let time_left = config.socket_timeout.saturating_sub(started.elapsed());
        if time_left.is_zero() {
            warn!(stragglers = remaining, "multi-get deadline reached, aborting");
            abort_active(conns, &active);
            return Ok(());
        }

        events.clear();
        let fired = match poller.wait(&mut events, Some(time_left)) {
            Ok(fired) => fired,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                abort_active(conns, &active);
                return Err(poll_error(e));
            }
        };
        if fired == 0 {
            warn!(stragglers = remaining, "multi-get deadline reached, aborting");
            abort_active(conns, &active);
            return Ok(());
        }

        for ev in events.iter() {
            let i = ev.key;
            if !active[i] {
                continue;
            }
            match conns[i].multi_response_nonblock(emit) {
                Ok(()) => {
                    if conns[i].multi_response_completed() {
                        if let Some(fd) = conns[i].borrowed_fd() {
                            let _ = poller.delete(fd);
                        }
                        if let Err(err) = conns[i].multi_response_finish() {
                            warn!(server = conns[i].name(), error = %err, "multi-get finish failed");
                            conns[i].multi_response_abort();
                        }
                        active[i] = false;
                        remaining -= 1;
                    } else {
                        // The poller is oneshot; re-arm for the next read.
                        let rearm = match conns[i].borrowed_fd() {
                            Some(fd) => poller.modify(fd, Event::readable(i)),
                            None => Ok(()),
                        };
                        if let Err(e) = rearm {
                            abort_active(conns, &active);
                            return Err(poll_error(e));
                        }
                    }
                }
                Err(err) => {
                    // One bad socket poisons the whole operation.
                    abort_active(conns, &active);
                    return Err(err);
                }
            }
        }
    }

    Ok(())
}
