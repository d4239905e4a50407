// Copyright 2024 RustFS Team
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

//! Background release of holds whose owner was dropped without releasing.
//!
//! Guards cannot await in `Drop`, so they hand their handles to a worker that runs
//! on a dedicated thread-bound Tokio runtime. This keeps releases alive even when the
//! dropping task was cancelled or its runtime is shutting down.

use std::sync::LazyLock;
use std::thread;
use tokio::runtime::Builder;
use tokio::sync::mpsc;

use crate::{handle::RefreshingLockHandle, types::LockType};

/// Handles to release, strictly in the given order
#[derive(Debug)]
pub(crate) struct ReleaseJob {
    pub(crate) levels: Vec<(RefreshingLockHandle, LockType)>,
}

impl ReleaseJob {
    async fn run(self) {
        for (handle, lock_type) in self.levels {
            handle.release(lock_type).await;
        }
    }
}

fn build_runtime() -> Option<tokio::runtime::Runtime> {
    match Builder::new_current_thread().enable_all().build() {
        Ok(rt) => Some(rt),
        Err(err) => {
            tracing::error!("Failed to build runtime for background lock release: {}", err);
            None
        }
    }
}

static RELEASE_TX: LazyLock<Option<mpsc::UnboundedSender<ReleaseJob>>> = LazyLock::new(|| {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReleaseJob>();

    let spawned = thread::Builder::new()
        .name("hilok-release".to_string())
        .spawn(move || {
            let Some(rt) = build_runtime() else {
                return;
            };
            rt.block_on(async move {
                while let Some(job) = rx.recv().await {
                    job.run().await;
                }
            });
        });

    match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
            tracing::error!("Failed to spawn background lock release worker: {}", err);
            None
        }
    }
});

/// Queue `job` on the release worker, falling back to a short-lived thread
pub(crate) fn schedule(job: ReleaseJob) {
    if job.levels.is_empty() {
        return;
    }

    let job = match RELEASE_TX.as_ref() {
        Some(tx) => match tx.send(job) {
            Ok(()) => return,
            Err(mpsc::error::SendError(job)) => job,
        },
        None => job,
    };

    tracing::warn!(
        "Release worker unavailable, spawning fallback release thread for {} levels",
        job.levels.len()
    );
    let spawned = thread::Builder::new()
        .name("hilok-release-fallback".to_string())
        .spawn(move || {
            if let Some(rt) = build_runtime() {
                rt.block_on(job.run());
            }
        });
    if let Err(err) = spawned {
        tracing::error!("Failed to spawn fallback release thread, leases will expire on their own: {}", err);
    }
}
