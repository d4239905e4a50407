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

use anyhow::{Context, Result, bail};
use hilok::{HiLokConfig, HierarchicalLockCoordinator, LockType, OwnerToken};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Command, Config};

pub async fn run(config: &Config, lock_config: HiLokConfig) -> Result<()> {
    let coordinator = hilok::connect(&config.redis_url, lock_config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redacted_redis_url()))?;

    match &config.command {
        Command::Status { path, owner } => status(&coordinator, path, owner.clone()).await,
        Command::Acquire {
            path,
            mode,
            owner,
            timeout_ms,
            no_block,
        } => acquire(&coordinator, path, *mode, owner.clone(), !*no_block, Duration::from_millis(*timeout_ms)).await,
        Command::Release { path, mode, owner } => release(&coordinator, path, *mode, owner).await,
        Command::Hold {
            path,
            mode,
            seconds,
            timeout_ms,
        } => {
            hold(
                &coordinator,
                path,
                *mode,
                Duration::from_secs(*seconds),
                Duration::from_millis(*timeout_ms),
            )
            .await
        }
    }
}

async fn status(coordinator: &HierarchicalLockCoordinator, path: &str, owner: Option<OwnerToken>) -> Result<()> {
    // Without a token every level reports owned = false
    let owner = owner.unwrap_or_else(OwnerToken::generate);
    let statuses = coordinator.status(path, &owner).await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn acquire(
    coordinator: &HierarchicalLockCoordinator,
    path: &str,
    mode: LockType,
    owner: Option<OwnerToken>,
    block: bool,
    timeout: Duration,
) -> Result<()> {
    let owner = match mode {
        LockType::Shared => coordinator.acquire_read(path, block, timeout, owner).await,
        LockType::Exclusive => coordinator.acquire_write(path, block, timeout, owner).await,
    }
    .with_context(|| format!("Failed to acquire {mode} lock on '{path}'"))?;

    info!(
        "Acquired {} lock on '{}', release within {:?}",
        mode,
        path,
        coordinator.config().ttl
    );
    println!("{owner}");
    Ok(())
}

async fn release(coordinator: &HierarchicalLockCoordinator, path: &str, mode: LockType, owner: &OwnerToken) -> Result<()> {
    match mode {
        LockType::Shared => coordinator.release_read(path, owner).await?,
        LockType::Exclusive => coordinator.release_write(path, owner).await?,
    }
    info!("Released {} lock on '{}'", mode, path);
    Ok(())
}

async fn hold(
    coordinator: &HierarchicalLockCoordinator,
    path: &str,
    mode: LockType,
    duration: Duration,
    timeout: Duration,
) -> Result<()> {
    let guard = match mode {
        LockType::Shared => coordinator.read_guard(path, true, timeout, None).await,
        LockType::Exclusive => coordinator.write_guard(path, true, timeout, None).await,
    }
    .with_context(|| format!("Failed to acquire {mode} lock on '{path}'"))?;

    println!("{}", guard.owner_token());
    info!("Holding {} lock on '{}' for {:?}, Ctrl-C to release early", mode, path, duration);

    let lost = guard.cancellation_token();
    let interrupted_by_loss = tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, releasing");
            false
        }
        _ = lost.cancelled() => true,
    };

    let was_lost = guard.is_lost();
    guard.release().await;
    info!("Released {} lock on '{}'", mode, path);

    if interrupted_by_loss || was_lost {
        bail!("Lock on '{}' was lost while held", path);
    }
    Ok(())
}
