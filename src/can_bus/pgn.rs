//! Victron PGN frame encoders.
//!
//! Every encoder is a pure function: `PgnInputs -> [u8; 8]`. All multi-byte
//! fields are little-endian on the wire unless noted in a given encoder's
//! doc comment. Numeric fields clamp at their representable bounds rather
//! than wrapping.

/// Snapshot of everything a PGN encoder might need, assembled by the
/// orchestrator from the register cache, the CVL output, and identity
/// strings out of configuration.
#[derive(Debug, Clone, Copy)]
pub struct PgnInputs<'a> {
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub soc_pct: f32,
    pub soh_pct: f32,
    pub soc_high_res_pct: f32,
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub mosfet_temp_c: f32,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub min_temp_c: f32,
    pub max_temp_c: f32,
    pub alarms: AlarmState,
    pub manufacturer: &'a str,
    pub model_id: u16,
    pub firmware_word: u16,
    pub internal_firmware_word: u16,
    pub capacity_ah: f32,
    pub battery_name: &'a str,
    pub battery_family: &'a str,
    pub serial_number: &'a str,
    pub modules_ok: bool,
    pub blocking_charge: bool,
    pub blocking_discharge: bool,
    pub offline_count: u8,
    pub charged_wh: f64,
    pub discharged_wh: f64,
}

/// Hysteretic 2-bit alarm/warning state for the fields encoded into 0x35A.
/// `0` = ok, `1` = warning, `2` = alarm, `3` = reserved/unused.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmState {
    pub under_voltage: u8,
    pub over_voltage: u8,
    pub over_temperature: u8,
    pub low_temperature: u8,
    pub high_temp_charge: u8,
    pub low_temp_charge: u8,
    pub high_current_discharge: u8,
    pub high_current_charge: u8,
    pub imbalance: u8,
    pub system_online: u8,
}

/// Thresholds `evaluate_alarms` checks against, sourced from the `safety`/
/// `balance` settings registers (300–343).
#[derive(Debug, Clone, Copy)]
pub struct AlarmThresholds {
    pub over_voltage_cutoff_mv: u16,
    pub over_voltage_warn_margin_mv: u16,
    pub under_voltage_cutoff_mv: u16,
    pub under_voltage_warn_margin_mv: u16,
    pub over_temp_cutoff_c: f32,
    pub over_temp_warn_margin_c: f32,
    pub under_temp_cutoff_c: f32,
    pub under_temp_warn_margin_c: f32,
    pub charge_high_temp_cutoff_c: f32,
    pub charge_low_temp_cutoff_c: f32,
    pub discharge_high_current_limit_a: f32,
    pub charge_high_current_limit_a: f32,
    pub current_warn_margin_pct: f32,
    pub imbalance_warn_mv: u16,
    pub imbalance_alarm_mv: u16,
}

/// Live values `evaluate_alarms` checks against [`AlarmThresholds`].
#[derive(Debug, Clone, Copy)]
pub struct AlarmInputs {
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub mosfet_temp_c: f32,
    pub ambient_temp_c: f32,
    pub pack_current_a: f32,
    pub max_imbalance_mv: f32,
    pub charging: bool,
    pub system_online: bool,
}

/// 2-bit level for a value where higher is worse (over-voltage, over-temp,
/// over-current): `alarm` at or past the cutoff, `warn` within `margin` of
/// it, `ok` otherwise.
fn level_above(value: f32, cutoff: f32, margin: f32) -> u8 {
    if value >= cutoff {
        2
    } else if value >= cutoff - margin {
        1
    } else {
        0
    }
}

/// 2-bit level for a value where lower is worse (under-voltage, under-temp).
fn level_below(value: f32, cutoff: f32, margin: f32) -> u8 {
    if value <= cutoff {
        2
    } else if value <= cutoff + margin {
        1
    } else {
        0
    }
}

/// Derive the hysteretic 0x35A alarm/warning bits from the current sample
/// and the operator-configured thresholds. Charge-specific temperature
/// limits (`high_temp_charge`/`low_temp_charge`) only evaluate while
/// `inputs.charging` is set; they read `ok` otherwise since they gate
/// charging, not discharging.
pub fn evaluate_alarms(inputs: &AlarmInputs, t: &AlarmThresholds) -> AlarmState {
    let pack_temp_c = inputs.mosfet_temp_c.max(inputs.ambient_temp_c);
    let pack_temp_low_c = inputs.mosfet_temp_c.min(inputs.ambient_temp_c);

    let (high_temp_charge, low_temp_charge) = if inputs.charging {
        (level_above(pack_temp_c, t.charge_high_temp_cutoff_c, t.over_temp_warn_margin_c), level_below(pack_temp_low_c, t.charge_low_temp_cutoff_c, t.under_temp_warn_margin_c))
    } else {
        (0, 0)
    };

    let high_current_discharge = if inputs.pack_current_a < 0.0 {
        level_above(-inputs.pack_current_a, t.discharge_high_current_limit_a, t.discharge_high_current_limit_a * t.current_warn_margin_pct / 100.0)
    } else {
        0
    };
    let high_current_charge = if inputs.pack_current_a > 0.0 {
        level_above(inputs.pack_current_a, t.charge_high_current_limit_a, t.charge_high_current_limit_a * t.current_warn_margin_pct / 100.0)
    } else {
        0
    };

    AlarmState {
        under_voltage: level_below(inputs.min_cell_mv as f32, t.under_voltage_cutoff_mv as f32, t.under_voltage_warn_margin_mv as f32),
        over_voltage: level_above(inputs.max_cell_mv as f32, t.over_voltage_cutoff_mv as f32, t.over_voltage_warn_margin_mv as f32),
        over_temperature: level_above(pack_temp_c, t.over_temp_cutoff_c, t.over_temp_warn_margin_c),
        low_temperature: level_below(pack_temp_low_c, t.under_temp_cutoff_c, t.under_temp_warn_margin_c),
        high_temp_charge,
        low_temp_charge,
        high_current_discharge,
        high_current_charge,
        imbalance: level_above(inputs.max_imbalance_mv, t.imbalance_alarm_mv as f32, (t.imbalance_alarm_mv - t.imbalance_warn_mv) as f32),
        system_online: u8::from(!inputs.system_online) * 2,
    }
}

const RESERVED_2BIT: u8 = 0x3;

fn pack_2bit_slots(slots: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, byte) in out.iter_mut().enumerate() {
        let mut b = 0u8;
        for j in 0..4 {
            let idx = i * 4 + j;
            let v = slots.get(idx).copied().unwrap_or(RESERVED_2BIT) & 0x3;
            b |= v << (j * 2);
        }
        *byte = b;
    }
    out
}

fn ascii8(s: &str) -> [u8; 8] {
    let mut out = [b' '; 8];
    let bytes = s.as_bytes();
    let n = bytes.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn clamp_u16(v: f32) -> u16 {
    v.round().clamp(0.0, u16::MAX as f32) as u16
}

fn clamp_i16(v: f32) -> i16 {
    v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// 0x351: CVL (V×10), CCL (A×10), DCL (A×10), each a little-endian `u16`.
pub fn encode_0x351(i: &PgnInputs) -> [u8; 8] {
    let cvl = clamp_u16(i.cvl_v * 10.0).to_le_bytes();
    let ccl = clamp_u16(i.ccl_a * 10.0).to_le_bytes();
    let dcl = clamp_u16(i.dcl_a * 10.0).to_le_bytes();
    [cvl[0], cvl[1], ccl[0], ccl[1], dcl[0], dcl[1], 0, 0]
}

/// 0x355: SOC % u16, SOH % u16, high-res SOC u16 (0.01 %).
pub fn encode_0x355(i: &PgnInputs) -> [u8; 8] {
    let soc = clamp_u16(i.soc_pct).to_le_bytes();
    let soh = clamp_u16(i.soh_pct).to_le_bytes();
    let soc_hr = clamp_u16(i.soc_high_res_pct * 100.0).to_le_bytes();
    [soc[0], soc[1], soh[0], soh[1], soc_hr[0], soc_hr[1], 0, 0]
}

/// 0x356: Pack V ×100 u16, Pack I ×10 i16, MOSFET temperature ×10 i16.
pub fn encode_0x356(i: &PgnInputs) -> [u8; 8] {
    let v = clamp_u16(i.pack_voltage_v * 100.0).to_le_bytes();
    let c = clamp_i16(i.pack_current_a * 10.0).to_le_bytes();
    let t = clamp_i16(i.mosfet_temp_c * 10.0).to_le_bytes();
    [v[0], v[1], c[0], c[1], t[0], t[1], 0, 0]
}

/// 0x35A: eight 2-bit alarm/warning slots per the documented field order.
pub fn encode_0x35a(i: &PgnInputs) -> [u8; 8] {
    let a = &i.alarms;
    pack_2bit_slots(&[
        a.under_voltage,
        a.over_voltage,
        a.over_temperature,
        a.low_temperature,
        a.high_temp_charge,
        a.low_temp_charge,
        a.high_current_discharge,
        a.high_current_charge,
        a.high_current_charge,
        a.imbalance,
        a.system_online,
    ])
}

/// 0x35E: manufacturer string, space-padded ASCII.
pub fn encode_0x35e(i: &PgnInputs) -> [u8; 8] {
    ascii8(i.manufacturer)
}

/// 0x35F: model id + firmware word + capacity (Ah ×100) + internal firmware.
pub fn encode_0x35f(i: &PgnInputs) -> [u8; 8] {
    let model = i.model_id.to_le_bytes();
    let fw = i.firmware_word.to_le_bytes();
    let cap = clamp_u16(i.capacity_ah * 100.0).to_le_bytes();
    let ifw = i.internal_firmware_word.to_le_bytes();
    [model[0], model[1], fw[0], fw[1], cap[0], cap[1], ifw[0], ifw[1]]
}

/// 0x370/0x371: battery/BMS name parts 1 and 2, 8 ASCII bytes each.
pub fn encode_0x370_0x371(i: &PgnInputs) -> ([u8; 8], [u8; 8]) {
    let bytes = i.battery_name.as_bytes();
    let mut part1 = [b' '; 8];
    let mut part2 = [b' '; 8];
    let n1 = bytes.len().min(8);
    part1[..n1].copy_from_slice(&bytes[..n1]);
    if bytes.len() > 8 {
        let n2 = (bytes.len() - 8).min(8);
        part2[..n2].copy_from_slice(&bytes[8..8 + n2]);
    }
    (part1, part2)
}

/// 0x372: `{modules_ok, blocking_charge, blocking_discharge, offline_count}`.
pub fn encode_0x372(i: &PgnInputs) -> [u8; 8] {
    [u8::from(i.modules_ok), u8::from(i.blocking_charge), u8::from(i.blocking_discharge), i.offline_count, 0, 0, 0, 0]
}

/// 0x373: `{min_cell_mV, max_cell_mV, min_temp_K, max_temp_K}`, all little-endian u16.
pub fn encode_0x373(i: &PgnInputs) -> [u8; 8] {
    let min_mv = i.min_cell_mv.to_le_bytes();
    let max_mv = i.max_cell_mv.to_le_bytes();
    let min_k = clamp_u16(i.min_temp_c + 273.15).to_le_bytes();
    let max_k = clamp_u16(i.max_temp_c + 273.15).to_le_bytes();
    [min_mv[0], min_mv[1], max_mv[0], max_mv[1], min_k[0], min_k[1], max_k[0], max_k[1]]
}

fn ascii_mv_identifier(prefix: &str, mv: u16) -> [u8; 8] {
    let mut out = [b' '; 8];
    let p = prefix.as_bytes();
    out[..p.len().min(4)].copy_from_slice(&p[..p.len().min(4)]);
    let digits = format!("{:04}", mv.min(9999));
    let db = digits.as_bytes();
    out[4..8].copy_from_slice(&db[..4]);
    out
}

/// 0x374/0x375: `"MINVxxxx"`/`"MAXVxxxx"`, 4-digit millivolt identifiers.
pub fn encode_0x374(i: &PgnInputs) -> [u8; 8] {
    ascii_mv_identifier("MINV", i.min_cell_mv)
}
pub fn encode_0x375(i: &PgnInputs) -> [u8; 8] {
    ascii_mv_identifier("MAXV", i.max_cell_mv)
}

fn ascii_signed_temp_identifier(prefix: &str, celsius: f32) -> [u8; 8] {
    let mut out = [b' '; 8];
    let p = prefix.as_bytes();
    out[..p.len().min(4)].copy_from_slice(&p[..p.len().min(4)]);
    let t = celsius.round().clamp(-999.0, 999.0) as i32;
    out[4] = if t < 0 { b'-' } else { b'+' };
    let digits = format!("{:03}", t.unsigned_abs());
    let db = digits.as_bytes();
    out[5..8].copy_from_slice(&db[..3]);
    out
}

/// 0x376/0x377: `"MINT±ddd"`/`"MAXT±ddd"`, signed degrees Celsius.
pub fn encode_0x376(i: &PgnInputs) -> [u8; 8] {
    ascii_signed_temp_identifier("MINT", i.min_temp_c)
}
pub fn encode_0x377(i: &PgnInputs) -> [u8; 8] {
    ascii_signed_temp_identifier("MAXT", i.max_temp_c)
}

/// 0x378: cumulative energy in/out, Wh/100, two little-endian u32.
pub fn encode_0x378(i: &PgnInputs) -> [u8; 8] {
    let in_wh100 = ((i.charged_wh / 100.0).max(0.0) as u32).to_le_bytes();
    let out_wh100 = ((i.discharged_wh / 100.0).max(0.0) as u32).to_le_bytes();
    [in_wh100[0], in_wh100[1], in_wh100[2], in_wh100[3], out_wh100[0], out_wh100[1], out_wh100[2], out_wh100[3]]
}

/// 0x379: installed capacity Ah u16, scaled by SOH %/100.
pub fn encode_0x379(i: &PgnInputs) -> [u8; 8] {
    let installed = clamp_u16(i.capacity_ah * (i.soh_pct / 100.0)).to_le_bytes();
    [installed[0], installed[1], 0, 0, 0, 0, 0, 0]
}

/// 0x380/0x381: serial number parts 1/2, 8 ASCII bytes each.
pub fn encode_0x380_0x381(i: &PgnInputs) -> ([u8; 8], [u8; 8]) {
    let bytes = i.serial_number.as_bytes();
    let mut part1 = [b' '; 8];
    let mut part2 = [b' '; 8];
    let n1 = bytes.len().min(8);
    part1[..n1].copy_from_slice(&bytes[..n1]);
    if bytes.len() > 8 {
        let n2 = (bytes.len() - 8).min(8);
        part2[..n2].copy_from_slice(&bytes[8..8 + n2]);
    }
    (part1, part2)
}

/// 0x382: battery family, space-padded ASCII.
pub fn encode_0x382(i: &PgnInputs) -> [u8; 8] {
    ascii8(i.battery_family)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> PgnInputs<'static> {
        PgnInputs {
            cvl_v: 0.0,
            ccl_a: 0.0,
            dcl_a: 0.0,
            soc_pct: 0.0,
            soh_pct: 100.0,
            soc_high_res_pct: 0.0,
            pack_voltage_v: 0.0,
            pack_current_a: 0.0,
            mosfet_temp_c: 0.0,
            min_cell_mv: 0,
            max_cell_mv: 0,
            min_temp_c: 0.0,
            max_temp_c: 0.0,
            alarms: AlarmState::default(),
            manufacturer: "Acme",
            model_id: 1,
            firmware_word: 0x0102,
            internal_firmware_word: 0,
            capacity_ah: 100.0,
            battery_name: "gateway",
            battery_family: "tinybms",
            serial_number: "SN12345678",
            modules_ok: true,
            blocking_charge: false,
            blocking_discharge: false,
            offline_count: 0,
            charged_wh: 0.0,
            discharged_wh: 0.0,
        }
    }

    #[test]
    fn scenario_8_pgn_0x356_encoding() {
        let inputs = PgnInputs { pack_voltage_v: 49.92, pack_current_a: -12.3, mosfet_temp_c: 24.5, ..base_inputs() };
        let frame = encode_0x356(&inputs);
        assert_eq!(frame, [0x80, 0x13, 0x85, 0xFF, 0xF5, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn pgn_0x351_encodes_little_endian_tenths() {
        let inputs = PgnInputs { cvl_v: 54.0, ccl_a: 100.0, dcl_a: 200.0, ..base_inputs() };
        let frame = encode_0x351(&inputs);
        assert_eq!(&frame[0..2], &540u16.to_le_bytes());
        assert_eq!(&frame[2..4], &1000u16.to_le_bytes());
        assert_eq!(&frame[4..6], &2000u16.to_le_bytes());
    }

    #[test]
    fn ascii_fields_are_space_padded() {
        let frame = encode_0x35e(&base_inputs());
        assert_eq!(&frame, b"Acme    ");
    }

    #[test]
    fn mv_identifier_right_aligns_digits() {
        let inputs = PgnInputs { min_cell_mv: 3300, ..base_inputs() };
        let frame = encode_0x374(&inputs);
        assert_eq!(&frame, b"MINV3300");
    }

    #[test]
    fn temp_identifier_includes_sign() {
        let inputs = PgnInputs { min_temp_c: -5.0, ..base_inputs() };
        let frame = encode_0x376(&inputs);
        assert_eq!(&frame, b"MINT-005");
    }

    #[test]
    fn alarm_slots_pack_two_bits_each() {
        let mut inputs = base_inputs();
        inputs.alarms.over_voltage = 2;
        let frame = encode_0x35a(&inputs);
        assert_eq!(frame[0] & 0b1100, 0b1000);
    }

    fn thresholds() -> AlarmThresholds {
        AlarmThresholds {
            over_voltage_cutoff_mv: 3650,
            over_voltage_warn_margin_mv: 50,
            under_voltage_cutoff_mv: 2800,
            under_voltage_warn_margin_mv: 50,
            over_temp_cutoff_c: 60.0,
            over_temp_warn_margin_c: 5.0,
            under_temp_cutoff_c: -20.0,
            under_temp_warn_margin_c: 5.0,
            charge_high_temp_cutoff_c: 45.0,
            charge_low_temp_cutoff_c: 0.0,
            discharge_high_current_limit_a: 200.0,
            charge_high_current_limit_a: 100.0,
            current_warn_margin_pct: 10.0,
            imbalance_warn_mv: 40,
            imbalance_alarm_mv: 80,
        }
    }

    fn ok_inputs() -> AlarmInputs {
        AlarmInputs {
            min_cell_mv: 3300,
            max_cell_mv: 3320,
            mosfet_temp_c: 25.0,
            ambient_temp_c: 24.0,
            pack_current_a: 0.0,
            max_imbalance_mv: 10.0,
            charging: false,
            system_online: true,
        }
    }

    #[test]
    fn evaluate_alarms_reads_ok_within_thresholds() {
        let state = evaluate_alarms(&ok_inputs(), &thresholds());
        assert_eq!(state.over_voltage, 0);
        assert_eq!(state.under_voltage, 0);
        assert_eq!(state.system_online, 0);
    }

    #[test]
    fn evaluate_alarms_flags_over_voltage_alarm_at_cutoff() {
        let inputs = AlarmInputs { max_cell_mv: 3700, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.over_voltage, 2);
    }

    #[test]
    fn evaluate_alarms_flags_under_voltage_warning_near_cutoff() {
        let inputs = AlarmInputs { min_cell_mv: 2820, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.under_voltage, 1);
    }

    #[test]
    fn evaluate_alarms_ignores_charge_temp_limits_while_not_charging() {
        let inputs = AlarmInputs { mosfet_temp_c: 50.0, ambient_temp_c: 50.0, charging: false, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.high_temp_charge, 0);
    }

    #[test]
    fn evaluate_alarms_flags_high_current_charge_over_limit() {
        let inputs = AlarmInputs { pack_current_a: 150.0, charging: true, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.high_current_charge, 2);
        assert_eq!(state.high_current_discharge, 0);
    }

    #[test]
    fn evaluate_alarms_flags_imbalance_alarm() {
        let inputs = AlarmInputs { max_imbalance_mv: 90.0, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.imbalance, 2);
    }

    #[test]
    fn evaluate_alarms_flags_system_offline() {
        let inputs = AlarmInputs { system_online: false, ..ok_inputs() };
        let state = evaluate_alarms(&inputs, &thresholds());
        assert_eq!(state.system_online, 2);
    }
}
