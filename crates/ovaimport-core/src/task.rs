//! Waiting on remote asynchronous tasks.
//!
//! Task state lives entirely on the remote side; the poller only observes it.
//! A local timeout therefore means "outcome unknown": the remote task is not
//! cancelled and may still finish.

use std::thread;
use std::time::{Duration, Instant};

use crate::api::{ManagementApi, RemoteTaskState, TaskTag};
use crate::error::{Error, Result};

/// Default delay between two status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest delay between two status queries, whatever the caller asks for.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default deadline for a task to reach a terminal state.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Terminal outcome of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    Complete,
    Error { message: Option<String> },
}

impl TerminalState {
    /// Turn an `Error` outcome into [`Error::RemoteTask`].
    pub fn into_result(self, tag: &TaskTag) -> Result<()> {
        match self {
            TerminalState::Complete => Ok(()),
            TerminalState::Error { message } => Err(Error::remote_task(
                tag.as_str(),
                message.unwrap_or_else(|| "task reported ERROR".to_string()),
            )),
        }
    }
}

/// Block until the task identified by `tag` reaches a terminal state.
///
/// Queries the task status every `poll_interval` (at least
/// [`MIN_POLL_INTERVAL`]) until it reports
/// `COMPLETE` or `ERROR`, or until `deadline` has elapsed. Transport
/// failures while querying are retried within the same deadline.
///
/// # Errors
///
/// - The last transport error, if the deadline ran out while the most recent
///   query was failing.
/// - [`Error::TimeoutExceeded`] otherwise, when no terminal state was seen.
pub fn await_task<A>(
    api: &A,
    tag: &TaskTag,
    deadline: Duration,
    poll_interval: Duration,
) -> Result<TerminalState>
where
    A: ManagementApi + ?Sized,
{
    tracing::info!(%tag, "waiting for task");
    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let started = Instant::now();
    let mut queries = 0u32;

    loop {
        queries += 1;
        let last_error = match api.task_status(tag) {
            Ok(task) => {
                tracing::debug!(%tag, state = ?task.state, queries, "task status");
                match task.state {
                    RemoteTaskState::Complete => {
                        tracing::info!(%tag, elapsed = ?started.elapsed(), "task completed");
                        return Ok(TerminalState::Complete);
                    }
                    RemoteTaskState::Error => {
                        tracing::warn!(%tag, message = ?task.error_message, "task failed");
                        return Ok(TerminalState::Error {
                            message: task.error_message,
                        });
                    }
                    RemoteTaskState::Pending | RemoteTaskState::Running => None,
                }
            }
            Err(e) => {
                tracing::warn!(%tag, error = %e, "task status query failed, retrying");
                Some(e)
            }
        };

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            if let Some(e) = last_error {
                return Err(e);
            }
            return Err(Error::TimeoutExceeded {
                tag: tag.to_string(),
                waited: elapsed,
            });
        }

        thread::sleep(poll_interval.min(deadline - elapsed));
    }
}

/// Wait for `tag` and convert an `ERROR` outcome into an error.
///
/// An empty tag means the remote call finished synchronously.
pub fn await_completion<A>(
    api: &A,
    tag: &TaskTag,
    deadline: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    A: ManagementApi + ?Sized,
{
    if tag.is_empty() {
        tracing::debug!("no task tag returned, nothing to wait for");
        return Ok(());
    }
    await_task(api, tag, deadline, poll_interval)?.into_result(tag)
}
