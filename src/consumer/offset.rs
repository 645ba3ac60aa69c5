// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Start offset resolution.
//!
//! First match wins:
//!
//! 1. Initial population in progress: `Timestamp(run start)`
//! 2. Stored checkpoint: `Offset(stored)`
//! 3. Offset tracked by the broker for the reference: `Offset(tracked)`
//! 4. The configured fallback
//!
//! Lookup failures in steps 2 and 3 are logged and treated as absent.

use tracing::{info, warn};

use crate::broker::{BrokerConnection, OffsetSpec};
use crate::checkpoint::CheckpointStore;
use crate::initial_population::InitialPopulation;

pub async fn resolve_start_offset<C, N>(
    population: &InitialPopulation,
    checkpoints: &C,
    connection: &N,
    reference: &str,
    stream: &str,
    fallback: OffsetSpec,
) -> OffsetSpec
where
    C: CheckpointStore + ?Sized,
    N: BrokerConnection + ?Sized,
{
    if let Some(spec) = population.start_offset() {
        info!(start = %spec, "Initial population in progress, starting from its start time");
        return spec;
    }

    match checkpoints.load(reference, stream).await {
        Ok(Some(offset)) => {
            info!(offset, "Loaded offset from storage");
            return OffsetSpec::Offset(offset);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not load the stored offset"),
    }

    match connection.query_offset(reference, stream).await {
        Ok(Some(offset)) => {
            info!(offset, "Using offset tracked by the broker");
            return OffsetSpec::Offset(offset);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not query the broker's tracked offset"),
    }

    info!(start = %fallback, "No stored offset, using fallback");
    fallback
}
