//! Chunked Sweep Controller
//!
//! Applies a per-cell mutation across a `width × height` grid a few columns
//! at a time, so no single tick pays for the whole grid.
//!
//! The usable area is the grid shrunk by `margin` on every edge, which keeps
//! neighbour reads in a cell body inside the grid. Columns are counted
//! pass-relative: column `c` of a pass is grid column `c + margin`, and a pass
//! covers `0..width - 2 * margin`. Each tick processes at most `budget`
//! columns, so a pass takes `ceil((width - 2 * margin) / budget)` ticks.
//!
//! Once a pass completes the controller idles. After `refresh_interval` idle
//! ticks it starts a fresh pass from column 0, picking up whatever drifted in
//! the meantime. A zero interval means one pass only.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::error::{catch_boundary, EngineError, HostFault};

/// Shape and pacing of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub width: usize,
    pub height: usize,
    pub margin: usize,
    /// Maximum columns processed per tick
    pub budget: usize,
    /// Idle ticks between the end of a pass and the next one; 0 disables
    pub refresh_interval: u32,
}

impl SweepConfig {
    /// Number of columns in one pass.
    pub fn columns(&self) -> usize {
        self.width.saturating_sub(2 * self.margin)
    }

    /// Grid rows visited in every column.
    pub fn rows(&self) -> Range<usize> {
        self.margin..self.height.saturating_sub(self.margin).max(self.margin)
    }

    /// Ticks needed to finish one pass.
    pub fn ticks_per_pass(&self) -> usize {
        let budget = self.budget.max(1);
        self.columns().div_ceil(budget).max(1)
    }
}

/// Progress through the current pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepCursor {
    pub next_column: usize,
    pub pass_complete: bool,
    pub ticks_since_complete: u32,
    /// Passes started so far, including the current one
    pub pass: u64,
    begun: bool,
}

impl SweepCursor {
    fn restart(&mut self) {
        self.next_column = 0;
        self.pass_complete = false;
        self.ticks_since_complete = 0;
        self.begun = false;
    }
}

/// Work done for each cell of a sweep
pub trait SweepBody {
    /// Called once before the first column of every pass. Returning `false`
    /// skips this tick and asks again next tick.
    fn begin_pass(&mut self) -> bool {
        true
    }

    /// Process one cell in absolute grid coordinates.
    fn visit(&mut self, x: usize, y: usize) -> Result<(), HostFault>;
}

impl<F> SweepBody for F
where
    F: FnMut(usize, usize) -> Result<(), HostFault>,
{
    fn visit(&mut self, x: usize, y: usize) -> Result<(), HostFault> {
        self(x, y)
    }
}

/// What one call to [`ChunkedSweepController::tick`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepTick {
    /// The feature is off; there is no cursor
    Disabled,
    /// `begin_pass` declined; nothing processed
    Skipped,
    /// Processed the pass-relative columns in `span`
    Advanced {
        span: Range<usize>,
        failed_columns: usize,
        completed: bool,
    },
    /// Pass complete, waiting for the refresh interval
    Idle { ticks_since_complete: u32 },
}

/// Incremental, budget-bounded grid traversal
#[derive(Debug)]
pub struct ChunkedSweepController {
    id: String,
    config: SweepConfig,
    cursor: Option<SweepCursor>,
    failed_columns: u64,
}

impl ChunkedSweepController {
    pub fn new(id: impl Into<String>, config: SweepConfig) -> Self {
        Self {
            id: id.into(),
            config,
            cursor: None,
            failed_columns: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn cursor(&self) -> Option<&SweepCursor> {
        self.cursor.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.cursor.is_some()
    }

    /// Total columns skipped because of faults, across all passes.
    pub fn failed_columns(&self) -> u64 {
        self.failed_columns
    }

    /// Start sweeping from column 0. Restarts if already enabled.
    pub fn enable(&mut self) {
        let pass = self.cursor.as_ref().map_or(0, |c| c.pass);
        let mut cursor = SweepCursor {
            pass: pass + 1,
            ..SweepCursor::default()
        };
        cursor.restart();
        self.cursor = Some(cursor);
        debug!(target: "hostpatch::sweep", sweep = %self.id, "Sweep enabled");
    }

    /// Stop sweeping and discard the cursor.
    pub fn disable(&mut self) {
        if self.cursor.take().is_some() {
            debug!(target: "hostpatch::sweep", sweep = %self.id, "Sweep disabled");
        }
    }

    /// Advance the sweep by at most `budget` columns.
    pub fn tick(&mut self, body: &mut dyn SweepBody) -> SweepTick {
        let Self {
            id,
            config,
            cursor,
            failed_columns,
        } = self;
        let Some(cursor) = cursor.as_mut() else {
            return SweepTick::Disabled;
        };

        if cursor.pass_complete {
            cursor.ticks_since_complete = cursor.ticks_since_complete.saturating_add(1);
            if config.refresh_interval == 0 || cursor.ticks_since_complete < config.refresh_interval {
                return SweepTick::Idle {
                    ticks_since_complete: cursor.ticks_since_complete,
                };
            }
            cursor.restart();
            cursor.pass += 1;
            debug!(target: "hostpatch::sweep", sweep = %id, pass = cursor.pass, "Refresh pass");
        }

        if !cursor.begun {
            if !body.begin_pass() {
                trace!(target: "hostpatch::sweep", sweep = %id, "Pass start declined");
                return SweepTick::Skipped;
            }
            cursor.begun = true;
        }

        let bound = config.columns();
        let start = cursor.next_column.min(bound);
        let end = (start + config.budget.max(1)).min(bound);
        let rows = config.rows();
        let mut failed = 0;

        for column in start..end {
            let x = column + config.margin;
            let outcome = catch_boundary(|| {
                for y in rows.clone() {
                    body.visit(x, y)?;
                }
                Ok(())
            });
            if let Err(fault) = outcome {
                failed += 1;
                let err = EngineError::SweepCellFailure {
                    sweep: id.clone(),
                    column,
                    fault,
                };
                if failed == 1 {
                    warn!(target: "hostpatch::sweep", error = %err, "Column skipped this pass");
                } else {
                    debug!(target: "hostpatch::sweep", error = %err, "Column skipped this pass");
                }
            }
        }
        *failed_columns += failed as u64;

        cursor.next_column = end;
        let completed = end >= bound;
        if completed {
            cursor.pass_complete = true;
            cursor.ticks_since_complete = 0;
            debug!(target: "hostpatch::sweep", sweep = %id, pass = cursor.pass, "Pass complete");
        }

        SweepTick::Advanced {
            span: start..end,
            failed_columns: failed,
            completed,
        }
    }
}
