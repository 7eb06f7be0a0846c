//! Model of the shared region lifecycle.
//!
//! The pure model tracks state, live guards and whether memory is mapped,
//! with the free deferred until the last guard leaves. [`execute_on_region`]
//! runs the same operations against a real [`SharedRegion`] and compares
//! what it observes with the model.

use std::time::Duration;

use pktq_shm::{QueueConfig, RegionGuard, RegionState, SharedRegion};

/// Operations on a region.
#[derive(Clone, Copy, Debug)]
pub enum RegionOp {
    Enable,
    Disable,
    /// Take a guard.
    Enter,
    /// Drop the guard at this position (modulo live guards).
    Exit(u8),
}

/// Pure lifecycle model.
#[derive(Debug)]
pub struct RegionModel {
    state: RegionState,
    mapped: bool,
    /// Bumped on every successful enable.
    generation: u32,
    /// Generation each live guard was granted under.
    guards: Vec<u32>,
}

impl Default for RegionModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionModel {
    pub fn new() -> Self {
        Self {
            state: RegionState::Uninitialized,
            mapped: false,
            generation: 0,
            guards: Vec::new(),
        }
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn in_flight(&self) -> usize {
        self.guards.len()
    }

    /// Returns whether a new region was published.
    pub fn enable(&mut self) -> bool {
        // A draining region still owns its memory.
        if self.mapped {
            return false;
        }
        self.mapped = true;
        self.generation += 1;
        self.state = RegionState::Published;
        true
    }

    /// Start draining. Memory is released once no guard is left.
    pub fn disable(&mut self) -> bool {
        if self.state != RegionState::Published {
            return false;
        }
        self.state = RegionState::Draining;
        self.maybe_free();
        true
    }

    pub fn enter(&mut self) -> bool {
        if self.state != RegionState::Published {
            return false;
        }
        self.guards.push(self.generation);
        true
    }

    pub fn exit(&mut self, which: usize) -> bool {
        if self.guards.is_empty() {
            return false;
        }
        let which = which % self.guards.len();
        self.guards.swap_remove(which);
        self.maybe_free();
        true
    }

    fn maybe_free(&mut self) {
        if self.state == RegionState::Draining && self.guards.is_empty() {
            self.mapped = false;
            self.state = RegionState::Freed;
        }
    }
}

/// Execute a sequence of operations on the pure model and verify invariants.
pub fn execute_and_verify(ops: &[RegionOp]) -> Result<(), String> {
    let mut model = RegionModel::new();

    for (i, op) in ops.iter().enumerate() {
        let before = model.state;
        match *op {
            RegionOp::Enable => {
                let published = model.enable();
                if published && before == RegionState::Draining {
                    return Err(format!("op {}: enabled while draining", i));
                }
            }
            RegionOp::Disable => {
                model.disable();
            }
            RegionOp::Enter => {
                let granted = model.enter();
                if granted != (before == RegionState::Published) {
                    return Err(format!(
                        "op {}: guard granted={} in state {:?}",
                        i, granted, before
                    ));
                }
            }
            RegionOp::Exit(which) => {
                model.exit(which as usize);
            }
        }

        verify_region_invariants(&model, i)?;
    }

    // Drain: release every guard and disable.
    while model.exit(0) {}
    model.disable();
    if model.mapped {
        return Err("memory still mapped after final disable".to_string());
    }

    Ok(())
}

fn verify_region_invariants(model: &RegionModel, op_idx: usize) -> Result<(), String> {
    // Invariant 1: live guards pin the mapping
    if !model.guards.is_empty() && !model.mapped {
        return Err(format!(
            "after op {}: {} guards alive on unmapped region",
            op_idx,
            model.guards.len()
        ));
    }

    // Invariant 2: every guard belongs to the current mapping
    if let Some(g) = model.guards.iter().find(|&&g| g != model.generation) {
        return Err(format!(
            "after op {}: guard from generation {} outlived its mapping (now {})",
            op_idx, g, model.generation
        ));
    }

    // Invariant 3: state agrees with the mapping
    let consistent = match model.state {
        RegionState::Uninitialized | RegionState::Freed => !model.mapped,
        RegionState::Published => model.mapped,
        RegionState::Draining => model.mapped && !model.guards.is_empty(),
    };
    if !consistent {
        return Err(format!(
            "after op {}: state {:?} with mapped={} guards={}",
            op_idx,
            model.state,
            model.mapped,
            model.guards.len()
        ));
    }

    Ok(())
}

/// Run the operations against a real region alongside the model.
///
/// Guards stay alive across `Disable`; the real region must defer its free
/// to the last one exactly as the model does.
pub fn execute_on_region(ops: &[RegionOp]) -> Result<(), String> {
    let region = SharedRegion::new();
    let config = QueueConfig {
        rx_size: 4,
        rx_caplen: 64,
        tx_size: 4,
        tx_max_len: 64,
        grace_period: Duration::ZERO,
        ..QueueConfig::default()
    };
    let mut model = RegionModel::new();
    let mut guards: Vec<RegionGuard<'_>> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            RegionOp::Enable => {
                let expected = model.enable();
                let published = region
                    .enable(&config, None)
                    .map_err(|e| format!("op {}: enable failed: {}", i, e))?;
                if published != expected {
                    return Err(format!(
                        "op {}: enable returned {}, model {}",
                        i, published, expected
                    ));
                }
            }
            RegionOp::Disable => {
                let expected = model.disable();
                let disabled = region.disable(config.grace_period);
                if disabled != expected {
                    return Err(format!(
                        "op {}: disable returned {}, model {}",
                        i, disabled, expected
                    ));
                }
            }
            RegionOp::Enter => {
                let expected = model.enter();
                match region.enter() {
                    Some(guard) => {
                        if !expected {
                            return Err(format!("op {}: guard granted in {:?}", i, region.state()));
                        }
                        if guard.rx().size() != config.rx_size {
                            return Err(format!("op {}: guard sees a foreign rx header", i));
                        }
                        guards.push(guard);
                    }
                    None if expected => {
                        return Err(format!("op {}: guard refused while published", i));
                    }
                    None => {}
                }
            }
            RegionOp::Exit(which) => {
                if !guards.is_empty() {
                    let which = which as usize % guards.len();
                    guards.swap_remove(which);
                    model.exit(which);
                }
            }
        }

        if region.state() != model.state() {
            return Err(format!(
                "after op {}: region {:?}, model {:?}",
                i,
                region.state(),
                model.state()
            ));
        }
        if region.mapping().is_some() != model.mapped {
            return Err(format!(
                "after op {}: region mapped={}, model mapped={}",
                i,
                region.mapping().is_some(),
                model.mapped
            ));
        }
        if region.in_flight() != model.in_flight() {
            return Err(format!(
                "after op {}: region has {} guards, model {}",
                i,
                region.in_flight(),
                model.in_flight()
            ));
        }
    }

    drop(guards);
    region.disable(config.grace_period);
    if region.mapping().is_some() {
        return Err("region still mapped after final disable".to_string());
    }

    Ok(())
}
