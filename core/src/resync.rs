// Copyright 2025 HEM Sp. z o.o.
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

use std::fmt::{Display, Formatter};

use log::debug;
use thiserror::Error;

use crate::backend::DeviceBackend;
use crate::errors::BackendError;
use crate::state_cache::LogicalState;

/// Steps replayed onto a backend that just became authoritative, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncStep {
    LedCount,
    Smooth,
    Gamma,
    Brightness,
    Colors,
}

pub const RESYNC_STEPS: [ResyncStep; 5] = [
    ResyncStep::LedCount,
    ResyncStep::Smooth,
    ResyncStep::Gamma,
    ResyncStep::Brightness,
    ResyncStep::Colors,
];

impl Display for ResyncStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResyncStep::LedCount => write!(f, "LED count"),
            ResyncStep::Smooth => write!(f, "smoothing"),
            ResyncStep::Gamma => write!(f, "gamma"),
            ResyncStep::Brightness => write!(f, "brightness"),
            ResyncStep::Colors => write!(f, "colors"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Resynchronization failed at {step}: {source}")]
pub struct ResyncError {
    pub step: ResyncStep,
    #[source]
    pub source: BackendError,
}

/// Replay `state` onto `backend`, stopping at the first failing step.
///
/// The LED count read in the first step is written back into `state`. Returns the
/// steps that were applied; colors are left out when nothing was cached.
pub async fn resynchronize(
    backend: &dyn DeviceBackend,
    state: &mut LogicalState,
) -> Result<Vec<ResyncStep>, ResyncError> {
    let mut applied = Vec::with_capacity(RESYNC_STEPS.len());
    for step in RESYNC_STEPS {
        let result = match step {
            ResyncStep::LedCount => backend.led_count().await.map(|count| {
                state.led_count = count;
            }),
            ResyncStep::Smooth => backend.set_smooth(state.smooth).await,
            ResyncStep::Gamma => backend.set_gamma(state.gamma).await,
            ResyncStep::Brightness => backend.set_brightness(state.brightness).await,
            ResyncStep::Colors => {
                if !state.has_colors() {
                    continue;
                }
                backend.set_colors(&state.replay_colors()).await
            }
        };
        result.map_err(|source| ResyncError { step, source })?;
        debug!("Resynchronized {} on {}", step, backend.kind());
        applied.push(step);
    }
    Ok(applied)
}
