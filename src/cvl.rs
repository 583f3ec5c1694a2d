//! Charge-Voltage-Limit control law.
//!
//! A pure hysteretic state machine driven once per tick from a
//! [`CvlInputs`] snapshot and a [`CvlConfig`]. Mirrors the fault-evaluation
//! style of a hysteretic supervisor: every transition is a simple threshold
//! compare against the *previous* state, so the output for identical
//! `(inputs, config, previous_state)` is always identical.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvlState {
    Bulk,
    Transition,
    FloatApproach,
    Float,
    ImbalanceHold,
    Sustain,
}

#[derive(Debug, Clone, Copy)]
pub struct CvlConfig {
    pub bulk_threshold_pct: f32,
    pub transition_threshold_pct: f32,
    pub float_threshold_pct: f32,
    pub float_exit_threshold_pct: f32,
    pub float_approach_offset_v: f32,
    pub float_offset_v: f32,
    pub min_ccl_in_float_a: f32,
    pub imbalance_hold_mv: f32,
    pub imbalance_release_mv: f32,
    pub bulk_target_v: f32,
    pub series_cell_count: u16,
    pub cell_max_v: f32,
    pub cell_safety_threshold_v: f32,
    pub cell_safety_release_v: f32,
    pub cell_min_float_v: f32,
    pub protection_kp: f32,
    pub nominal_charge_current_a: f32,
    pub max_recovery_step_v: f32,
    pub sustain_enabled: bool,
    pub sustain_entry_pct: f32,
    pub sustain_exit_pct: f32,
    pub sustain_absolute_v: Option<f32>,
    pub sustain_per_cell_v: Option<f32>,
    pub sustain_ccl_a: f32,
    pub sustain_dcl_a: f32,
    pub imbalance_drop_per_mv: f32,
    pub imbalance_drop_cap_v: f32,
}

impl Default for CvlConfig {
    fn default() -> Self {
        Self {
            bulk_threshold_pct: 85.0,
            transition_threshold_pct: 90.0,
            float_threshold_pct: 98.0,
            float_exit_threshold_pct: 95.0,
            float_approach_offset_v: 0.2,
            float_offset_v: 0.4,
            min_ccl_in_float_a: 2.0,
            imbalance_hold_mv: 80.0,
            imbalance_release_mv: 40.0,
            bulk_target_v: 54.0,
            series_cell_count: 16,
            cell_max_v: 3.65,
            cell_safety_threshold_v: 3.60,
            cell_safety_release_v: 3.55,
            cell_min_float_v: 3.30,
            protection_kp: 0.5,
            nominal_charge_current_a: 100.0,
            max_recovery_step_v: 0.05,
            sustain_enabled: false,
            sustain_entry_pct: 99.0,
            sustain_exit_pct: 97.0,
            sustain_absolute_v: None,
            sustain_per_cell_v: None,
            sustain_ccl_a: 5.0,
            sustain_dcl_a: 100.0,
            imbalance_drop_per_mv: 0.002,
            imbalance_drop_cap_v: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CvlInputs {
    pub soc_pct: f32,
    pub max_imbalance_mv: f32,
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub max_cell_v: f32,
    pub base_ccl_a: f32,
    pub base_dcl_a: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct CvlOutput {
    pub state: CvlState,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub cell_protection_active: bool,
}

/// Carries forward the state a tick needs to remember: the previous
/// discrete state, the previous CVL (for the recovery-step clamp), and
/// whether cell protection was active last tick.
#[derive(Debug, Clone, Copy)]
pub struct CvlRuntime {
    pub state: CvlState,
    pub cvl_v: f32,
    pub cell_protection_was_active: bool,
}

impl CvlRuntime {
    pub fn initial(cfg: &CvlConfig) -> Self {
        Self { state: CvlState::Bulk, cvl_v: cfg.bulk_target_v, cell_protection_was_active: false }
    }
}

/// Evaluate one tick of the control law, returning the new runtime state
/// and the output limits.
pub fn evaluate(prev: CvlRuntime, inputs: CvlInputs, cfg: &CvlConfig) -> (CvlRuntime, CvlOutput) {
    let next_state = next_state(prev.state, inputs, cfg);
    let series = f32::from(cfg.series_cell_count);

    let state_cvl = state_cvl_voltage(next_state, inputs, cfg, series);

    let protection_active = inputs.max_cell_v >= cfg.cell_safety_threshold_v
        || (prev.cell_protection_was_active && inputs.max_cell_v > cfg.cell_safety_release_v);

    let mut final_cvl = if protection_active {
        let factor = 1.0 + inputs.pack_current_a.max(0.0) / cfg.nominal_charge_current_a;
        let drop = cfg.protection_kp * factor * (inputs.max_cell_v - cfg.cell_safety_threshold_v);
        (state_cvl - drop).max(cfg.cell_min_float_v * series)
    } else {
        state_cvl
    };

    if prev.cell_protection_was_active || protection_active {
        let ceiling = prev.cvl_v + cfg.max_recovery_step_v;
        final_cvl = final_cvl.min(ceiling);
    }

    let ratio = if state_cvl > 0.0 { (final_cvl / state_cvl).clamp(0.0, 1.0) } else { 0.0 };
    let mut ccl = inputs.base_ccl_a * ratio;
    let mut dcl = inputs.base_dcl_a * ratio;

    match next_state {
        CvlState::Float => ccl = ccl.max(cfg.min_ccl_in_float_a),
        CvlState::Sustain => {
            ccl = ccl.min(cfg.sustain_ccl_a);
            dcl = dcl.min(cfg.sustain_dcl_a);
        }
        _ => {}
    }

    let runtime = CvlRuntime { state: next_state, cvl_v: final_cvl, cell_protection_was_active: protection_active };
    let output = CvlOutput { state: next_state, cvl_v: final_cvl, ccl_a: ccl, dcl_a: dcl, cell_protection_active: protection_active };
    (runtime, output)
}

fn next_state(prev: CvlState, inputs: CvlInputs, cfg: &CvlConfig) -> CvlState {
    if cfg.sustain_enabled {
        let sustain_active = matches!(prev, CvlState::Sustain);
        if sustain_active {
            if inputs.soc_pct < cfg.sustain_exit_pct {
                return CvlState::Sustain;
            }
        } else if inputs.soc_pct <= cfg.sustain_entry_pct {
            return CvlState::Sustain;
        }
    }

    let imbalance_active = matches!(prev, CvlState::ImbalanceHold);
    if imbalance_active {
        if inputs.max_imbalance_mv > cfg.imbalance_release_mv {
            return CvlState::ImbalanceHold;
        }
    } else if inputs.max_imbalance_mv > cfg.imbalance_hold_mv && !matches!(prev, CvlState::Sustain) {
        return CvlState::ImbalanceHold;
    }

    match prev {
        CvlState::Bulk => {
            if inputs.soc_pct >= cfg.transition_threshold_pct {
                soc_class(inputs, cfg)
            } else {
                CvlState::Bulk
            }
        }
        CvlState::Transition => {
            if inputs.soc_pct >= cfg.float_threshold_pct {
                CvlState::Float
            } else if inputs.soc_pct < cfg.bulk_threshold_pct {
                CvlState::Bulk
            } else {
                CvlState::Transition
            }
        }
        CvlState::FloatApproach => {
            if inputs.soc_pct >= cfg.float_threshold_pct {
                CvlState::Float
            } else if inputs.soc_pct + 0.25 < cfg.transition_threshold_pct {
                CvlState::Transition
            } else {
                CvlState::FloatApproach
            }
        }
        CvlState::Float => {
            if inputs.soc_pct < cfg.float_exit_threshold_pct {
                soc_class(inputs, cfg)
            } else {
                CvlState::Float
            }
        }
        CvlState::ImbalanceHold | CvlState::Sustain => soc_class(inputs, cfg),
    }
}

/// Classify SOC into one of the non-hold/sustain states, used when a
/// hold/sustain condition just released and the machine re-enters the
/// ordinary bulk/transition/float ladder.
fn soc_class(inputs: CvlInputs, cfg: &CvlConfig) -> CvlState {
    if inputs.soc_pct >= cfg.float_threshold_pct {
        CvlState::Float
    } else if inputs.soc_pct >= cfg.transition_threshold_pct {
        CvlState::FloatApproach
    } else if inputs.soc_pct >= cfg.bulk_threshold_pct {
        CvlState::Transition
    } else {
        CvlState::Bulk
    }
}

fn state_cvl_voltage(state: CvlState, inputs: CvlInputs, cfg: &CvlConfig, series: f32) -> f32 {
    match state {
        CvlState::Bulk | CvlState::Transition => cfg.bulk_target_v,
        CvlState::FloatApproach => cfg.bulk_target_v - cfg.float_approach_offset_v,
        CvlState::Float => cfg.bulk_target_v - cfg.float_offset_v,
        CvlState::ImbalanceHold => {
            let excess_mv = (inputs.max_imbalance_mv - cfg.imbalance_hold_mv).max(0.0);
            let drop = (excess_mv * cfg.imbalance_drop_per_mv).min(cfg.imbalance_drop_cap_v);
            (cfg.bulk_target_v - drop).max(series * cfg.cell_min_float_v)
        }
        CvlState::Sustain => {
            let candidate = match (cfg.sustain_absolute_v, cfg.sustain_per_cell_v) {
                (Some(abs), Some(per_cell)) => abs.max(per_cell * series),
                (Some(abs), None) => abs,
                (None, Some(per_cell)) => per_cell * series,
                (None, None) => series * cfg.cell_min_float_v,
            };
            candidate.max(series * cfg.cell_min_float_v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> CvlConfig {
        CvlConfig {
            bulk_threshold_pct: 60.0,
            transition_threshold_pct: 85.0,
            float_threshold_pct: 98.0,
            float_exit_threshold_pct: 95.0,
            float_approach_offset_v: 0.2,
            float_offset_v: 0.4,
            min_ccl_in_float_a: 5.0,
            imbalance_hold_mv: 50.0,
            imbalance_release_mv: 30.0,
            bulk_target_v: 54.0,
            series_cell_count: 16,
            cell_max_v: 3.65,
            cell_safety_threshold_v: 3.60,
            cell_safety_release_v: 3.50,
            cell_min_float_v: 3.30,
            protection_kp: 0.5,
            nominal_charge_current_a: 100.0,
            max_recovery_step_v: 0.05,
            sustain_enabled: false,
            sustain_entry_pct: 20.0,
            sustain_exit_pct: 30.0,
            sustain_absolute_v: None,
            sustain_per_cell_v: None,
            sustain_ccl_a: 10.0,
            sustain_dcl_a: 10.0,
            imbalance_drop_per_mv: 0.01,
            imbalance_drop_cap_v: 1.0,
        }
    }

    #[test]
    fn scenario_5_float_approach() {
        let cfg = base_cfg();
        let prev = CvlRuntime { state: CvlState::Transition, cvl_v: cfg.bulk_target_v, cell_protection_was_active: false };
        let inputs = CvlInputs {
            soc_pct: 92.0,
            max_imbalance_mv: 20.0,
            pack_voltage_v: 53.0,
            pack_current_a: 10.0,
            max_cell_v: 3.45,
            base_ccl_a: 100.0,
            base_dcl_a: 200.0,
        };
        let (_rt, out) = evaluate(prev, inputs, &cfg);
        assert_eq!(out.state, CvlState::FloatApproach);
        assert!((out.cvl_v - 53.8).abs() < 1e-4);
        assert!((out.ccl_a - 100.0).abs() < 1e-4);
        assert!((out.dcl_a - 200.0).abs() < 1e-4);
    }

    #[test]
    fn scenario_6_cell_protection_clamp() {
        let cfg = base_cfg();
        let prev = CvlRuntime { state: CvlState::FloatApproach, cvl_v: 53.8, cell_protection_was_active: false };
        let inputs = CvlInputs {
            soc_pct: 92.0,
            max_imbalance_mv: 20.0,
            pack_voltage_v: 53.0,
            pack_current_a: 50.0,
            max_cell_v: 3.62,
            base_ccl_a: 100.0,
            base_dcl_a: 200.0,
        };
        let (rt, out) = evaluate(prev, inputs, &cfg);
        assert!(out.cell_protection_active);
        let abs_max = 53.8_f32;
        let expected_uncapped = abs_max - 0.5 * 1.5 * 0.02;
        let expected = expected_uncapped.min(prev.cvl_v + cfg.max_recovery_step_v);
        assert!((out.cvl_v - expected).abs() < 1e-4);
        assert!(rt.cell_protection_was_active);
    }

    #[test]
    fn bulk_to_transition_requires_hysteresis_not_dithering() {
        let cfg = base_cfg();
        let rt0 = CvlRuntime::initial(&cfg);
        let low = CvlInputs { soc_pct: 59.0, max_imbalance_mv: 0.0, pack_voltage_v: 50.0, pack_current_a: 5.0, max_cell_v: 3.3, base_ccl_a: 100.0, base_dcl_a: 100.0 };
        let (rt1, out1) = evaluate(rt0, low, &cfg);
        assert_eq!(out1.state, CvlState::Bulk);
        let high = CvlInputs { soc_pct: 84.0, ..low };
        let (_rt2, out2) = evaluate(rt1, high, &cfg);
        assert_eq!(out2.state, CvlState::Bulk, "below transition_threshold must stay in Bulk");
    }

    #[test]
    fn imbalance_hold_engages_and_releases() {
        let cfg = base_cfg();
        let rt0 = CvlRuntime::initial(&cfg);
        let imbalanced = CvlInputs { soc_pct: 70.0, max_imbalance_mv: 60.0, pack_voltage_v: 50.0, pack_current_a: 5.0, max_cell_v: 3.3, base_ccl_a: 100.0, base_dcl_a: 100.0 };
        let (rt1, out1) = evaluate(rt0, imbalanced, &cfg);
        assert_eq!(out1.state, CvlState::ImbalanceHold);
        let still_high = CvlInputs { max_imbalance_mv: 40.0, ..imbalanced };
        let (rt2, out2) = evaluate(rt1, still_high, &cfg);
        assert_eq!(out2.state, CvlState::ImbalanceHold, "release threshold not yet crossed");
        let released = CvlInputs { max_imbalance_mv: 20.0, ..imbalanced };
        let (_rt3, out3) = evaluate(rt2, released, &cfg);
        assert_ne!(out3.state, CvlState::ImbalanceHold);
    }
}
