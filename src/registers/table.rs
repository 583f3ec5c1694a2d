//! The process-wide register descriptor table.
//!
//! Built once from a `const` array; every address the gateway knows about
//! is listed here. Live-data addresses are sparse (0–99), followed by
//! statistics (100–117), the event log (200–297, 49 two-word slots) and
//! read/write settings (300–343), with the version block at 500–509.

use super::descriptor::{Access, EnumOption, PackedField, RegisterDescriptor, RegisterType, SpecialRaw};

const NOT_CONNECTED: SpecialRaw = SpecialRaw { raw: -32768, meaning: "sensor not connected" };

static ONLINE_STATUS_OPTIONS: &[EnumOption] = &[
    EnumOption { raw: 0, label: "charging" },
    EnumOption { raw: 1, label: "fully_charged" },
    EnumOption { raw: 2, label: "discharging" },
    EnumOption { raw: 3, label: "regeneration" },
    EnumOption { raw: 4, label: "idle" },
    EnumOption { raw: 5, label: "fault" },
];

static BOOL_OPTIONS: &[EnumOption] = &[EnumOption { raw: 0, label: "disabled" }, EnumOption { raw: 1, label: "enabled" }];

static CELL_COUNT_DETECT_OPTIONS: &[EnumOption] =
    &[EnumOption { raw: 0, label: "auto" }, EnumOption { raw: 1, label: "manual" }];

static EVENT_LOG_OVERWRITE_OPTIONS: &[EnumOption] =
    &[EnumOption { raw: 0, label: "stop_when_full" }, EnumOption { raw: 1, label: "overwrite_oldest" }];

static CAN_BITRATE_OPTIONS: &[EnumOption] = &[
    EnumOption { raw: 0, label: "125k" },
    EnumOption { raw: 1, label: "250k" },
    EnumOption { raw: 2, label: "500k" },
    EnumOption { raw: 3, label: "1000k" },
];

static UART_BAUD_OPTIONS: &[EnumOption] = &[
    EnumOption { raw: 0, label: "9600" },
    EnumOption { raw: 1, label: "19200" },
    EnumOption { raw: 2, label: "38400" },
    EnumOption { raw: 3, label: "57600" },
    EnumOption { raw: 4, label: "115200" },
];

/// GPIO numbers this board actually breaks out for UART/TWAI/status-LED
/// duty (matches `pins.rs`'s wiring and the peripherals `main.rs` takes).
static GPIO_OPTIONS: &[EnumOption] = &[
    EnumOption { raw: 4, label: "gpio4" },
    EnumOption { raw: 5, label: "gpio5" },
    EnumOption { raw: 16, label: "gpio16" },
    EnumOption { raw: 17, label: "gpio17" },
    EnumOption { raw: 18, label: "gpio18" },
    EnumOption { raw: 19, label: "gpio19" },
];

const fn rw_u16(address: u16, key: &'static str, label: &'static str, unit: &'static str, group: &'static str, scale: f64, min: i32, max: i32, step: i32, default: i32) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        ty: RegisterType::U16,
        access: Access::Rw,
        scale,
        precision: 4,
        min_raw: Some(min),
        max_raw: Some(max),
        step: Some(step),
        default_raw: default,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    }
}

const fn ro_u16(address: u16, key: &'static str, label: &'static str, unit: &'static str, group: &'static str, scale: f64) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        ty: RegisterType::U16,
        access: Access::Ro,
        scale,
        precision: 4,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: 0,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    }
}

const fn ro_i16(address: u16, key: &'static str, label: &'static str, unit: &'static str, group: &'static str, scale: f64) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        ty: RegisterType::I16,
        access: Access::Ro,
        scale,
        precision: 1,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: 0,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    }
}

#[allow(clippy::too_many_arguments)]
const fn rw_i16(address: u16, key: &'static str, label: &'static str, unit: &'static str, group: &'static str, scale: f64, min: i32, max: i32, step: i32, default: i32) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        ty: RegisterType::I16,
        access: Access::Rw,
        scale,
        precision: 1,
        min_raw: Some(min),
        max_raw: Some(max),
        step: Some(step),
        default_raw: default,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    }
}

#[allow(clippy::too_many_arguments)]
const fn rw_enum(address: u16, key: &'static str, label: &'static str, group: &'static str, default: i32, options: &'static [EnumOption]) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit: "",
        group,
        ty: RegisterType::Enum,
        access: Access::Rw,
        scale: 1.0,
        precision: 0,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: default,
        enum_table: Some(options),
        packed_fields: None,
        special_raw: None,
    }
}

/// A 16-bit word packed as `{major: high byte, minor: low byte}`, the
/// convention the version block's identity registers use on the wire.
const MAJOR_MINOR_FIELDS: [PackedField; 2] = [
    PackedField { name: "major", lo_bit: 8, hi_bit: 15, signed: false, scale: 1.0, enum_table: None },
    PackedField { name: "minor", lo_bit: 0, hi_bit: 7, signed: false, scale: 1.0, enum_table: None },
];

const fn packed_major_minor(address: u16, key: &'static str, label: &'static str, group: &'static str) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit: "",
        group,
        ty: RegisterType::Packed,
        access: Access::Ro,
        scale: 1.0,
        precision: 0,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: 0,
        enum_table: None,
        packed_fields: Some(&MAJOR_MINOR_FIELDS),
        special_raw: None,
    }
}

const fn ro_pair(address: u16, key: &'static str, label: &'static str, unit: &'static str, group: &'static str, ty: RegisterType, scale: f64) -> RegisterDescriptor {
    RegisterDescriptor {
        address,
        key,
        label,
        unit,
        group,
        ty,
        access: Access::Ro,
        scale,
        precision: 4,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: 0,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    }
}

/// Static live-data block (addresses 0–99, sparse).
pub const LIVE_DATA: &[RegisterDescriptor] = &[
    ro_u16(0, "cell_mv_0", "Cell 1 voltage", "V", "cells", 1e-4),
    ro_u16(1, "cell_mv_1", "Cell 2 voltage", "V", "cells", 1e-4),
    ro_u16(2, "cell_mv_2", "Cell 3 voltage", "V", "cells", 1e-4),
    ro_u16(3, "cell_mv_3", "Cell 4 voltage", "V", "cells", 1e-4),
    ro_u16(4, "cell_mv_4", "Cell 5 voltage", "V", "cells", 1e-4),
    ro_u16(5, "cell_mv_5", "Cell 6 voltage", "V", "cells", 1e-4),
    ro_u16(6, "cell_mv_6", "Cell 7 voltage", "V", "cells", 1e-4),
    ro_u16(7, "cell_mv_7", "Cell 8 voltage", "V", "cells", 1e-4),
    ro_u16(8, "cell_mv_8", "Cell 9 voltage", "V", "cells", 1e-4),
    ro_u16(9, "cell_mv_9", "Cell 10 voltage", "V", "cells", 1e-4),
    ro_u16(10, "cell_mv_10", "Cell 11 voltage", "V", "cells", 1e-4),
    ro_u16(11, "cell_mv_11", "Cell 12 voltage", "V", "cells", 1e-4),
    ro_u16(12, "cell_mv_12", "Cell 13 voltage", "V", "cells", 1e-4),
    ro_u16(13, "cell_mv_13", "Cell 14 voltage", "V", "cells", 1e-4),
    ro_u16(14, "cell_mv_14", "Cell 15 voltage", "V", "cells", 1e-4),
    ro_u16(15, "cell_mv_15", "Cell 16 voltage", "V", "cells", 1e-4),
    ro_pair(32, "lifetime_counter", "Lifetime counter", "s", "stats", RegisterType::U32, 1.0),
    ro_pair(34, "time_left", "Estimated time left", "s", "stats", RegisterType::U32, 1.0),
    ro_pair(36, "pack_voltage", "Pack voltage", "V", "live", RegisterType::F32, 1.0),
    ro_pair(38, "pack_current", "Pack current", "A", "live", RegisterType::F32, 1.0),
    ro_pair(46, "soc", "State of charge", "%", "live", RegisterType::U32, 1e-6),
    RegisterDescriptor {
        address: 50,
        key: "online_status",
        label: "Online status",
        unit: "",
        group: "live",
        ty: RegisterType::Enum,
        access: Access::Ro,
        scale: 1.0,
        precision: 0,
        min_raw: None,
        max_raw: None,
        step: None,
        default_raw: 4,
        enum_table: Some(ONLINE_STATUS_OPTIONS),
        packed_fields: None,
        special_raw: None,
    },
    ro_u16(51, "balancing_decision_bits", "Balancing decision bitmap", "", "live", 1.0),
    ro_u16(52, "balancing_real_bits", "Balancing real bitmap", "", "live", 1.0),
    ro_u16(53, "detected_cells", "Detected cell count", "", "live", 1.0),
    ro_pair(54, "speed", "Speed", "km/h", "live", RegisterType::F32, 1.0),
];

const fn mos_temp() -> RegisterDescriptor {
    let mut d = ro_i16(100, "mosfet_temp", "MOSFET temperature", "°C", "stats", 0.1);
    d.special_raw = Some(NOT_CONNECTED);
    d
}

/// Statistics block (100–117).
pub const STATS: &[RegisterDescriptor] = &[
    mos_temp(),
    ro_i16(101, "ambient_temp", "Ambient temperature", "°C", "stats", 0.1),
    ro_u16(102, "min_cell_mv_idx", "Min cell index", "", "stats", 1.0),
    ro_u16(103, "max_cell_mv_idx", "Max cell index", "", "stats", 1.0),
    ro_u16(104, "soh", "State of health", "%", "stats", 1.0),
];

/// Read/write settings block (300–343), grouped by `uart`, `battery`,
/// `safety`, `balance` and `hardware`, including the enum-valued
/// pin-selection registers (331–335) and the other discrete-choice
/// settings (323, 327, 330, 337, 338, 342).
pub const SETTINGS: &[RegisterDescriptor] = &[
    // uart
    rw_u16(300, "uart_poll_interval_ms", "UART poll interval", "ms", "uart", 1.0, 100, 60_000, 10, 500),
    // battery
    rw_u16(301, "over_voltage_cutoff_mv", "Over-voltage cutoff", "mV", "battery", 1.0, 2_500, 4_500, 1, 3_650),
    rw_u16(302, "under_voltage_cutoff_mv", "Under-voltage cutoff", "mV", "battery", 1.0, 2_000, 3_500, 1, 2_800),
    rw_u16(304, "series_cell_count", "Series cell count", "", "battery", 1.0, 1, 32, 1, 16),
    rw_u16(305, "nominal_capacity_ah", "Nominal capacity", "Ah", "battery", 0.01, 0, 65_535, 1, 10_000),
    rw_u16(306, "full_charge_cell_mv", "Full-charge per-cell voltage", "mV", "battery", 1.0, 3_000, 4_500, 1, 3_650),
    rw_u16(307, "recovery_hysteresis_mv", "Voltage-fault recovery hysteresis", "mV", "battery", 1.0, 0, 500, 1, 50),
    rw_u16(324, "charger_disconnect_current_ma", "Charger disconnect current", "mA", "battery", 1.0, 0, 5_000, 1, 500),
    rw_u16(325, "load_disconnect_voltage_mv", "Load disconnect voltage", "mV", "battery", 1.0, 2_000, 3_500, 1, 2_900),
    rw_u16(326, "sleep_threshold_ma", "Sleep current threshold", "mA", "battery", 1.0, 0, 1_000, 1, 50),
    // safety
    rw_u16(308, "over_voltage_warn_margin_mv", "Over-voltage warning margin", "mV", "safety", 1.0, 0, 500, 1, 50),
    rw_u16(309, "under_voltage_warn_margin_mv", "Under-voltage warning margin", "mV", "safety", 1.0, 0, 500, 1, 50),
    rw_i16(310, "over_temp_cutoff_c", "Over-temperature cutoff", "°C", "safety", 0.1, 0, 1_000, 1, 600),
    rw_i16(311, "over_temp_warn_margin_c", "Over-temperature warning margin", "°C", "safety", 0.1, 0, 200, 1, 50),
    rw_i16(312, "under_temp_cutoff_c", "Under-temperature cutoff", "°C", "safety", 0.1, -400, 200, 1, -200),
    rw_i16(313, "under_temp_warn_margin_c", "Under-temperature warning margin", "°C", "safety", 0.1, 0, 200, 1, 50),
    rw_i16(314, "charge_high_temp_cutoff_c", "Charge high-temperature cutoff", "°C", "safety", 0.1, 0, 800, 1, 450),
    rw_i16(315, "charge_low_temp_cutoff_c", "Charge low-temperature cutoff", "°C", "safety", 0.1, -400, 200, 1, 0),
    rw_u16(316, "discharge_high_current_limit_a", "Discharge high-current limit", "A", "safety", 0.1, 0, 6_000, 1, 2_000),
    rw_u16(317, "charge_high_current_limit_a", "Charge high-current limit", "A", "safety", 0.1, 0, 6_000, 1, 1_000),
    rw_u16(318, "current_warn_margin_pct", "High-current warning margin", "%", "safety", 1.0, 0, 100, 1, 10),
    // balance
    rw_u16(303, "balance_trigger_mv", "Balance trigger threshold", "mV", "balance", 1.0, 0, 200, 1, 20),
    rw_u16(319, "imbalance_warn_mv", "Cell imbalance warning threshold", "mV", "balance", 1.0, 0, 500, 1, 40),
    rw_u16(320, "imbalance_alarm_mv", "Cell imbalance alarm threshold", "mV", "balance", 1.0, 0, 500, 1, 80),
    rw_u16(321, "balance_finish_mv", "Balance finish threshold", "mV", "balance", 1.0, 0, 50, 1, 5),
    rw_u16(322, "balance_max_duration_min", "Balance max duration", "min", "balance", 1.0, 0, 1_440, 1, 120),
    rw_enum(323, "cell_count_detect_mode", "Cell count detection mode", "balance", 0, CELL_COUNT_DETECT_OPTIONS),
    // hardware
    rw_enum(327, "can_bitrate_kbps", "CAN bitrate", "hardware", 2, CAN_BITRATE_OPTIONS),
    rw_u16(328, "can_publisher_period_ms", "CAN publisher period", "ms", "hardware", 1.0, 100, 60_000, 10, 1_000),
    rw_u16(329, "can_keepalive_timeout_ms", "CAN keepalive timeout", "ms", "hardware", 1.0, 100, 600_000, 1, 5_000),
    rw_enum(330, "uart_baud_rate", "UART baud rate", "hardware", 4, UART_BAUD_OPTIONS),
    rw_enum(331, "uart_tx_pin", "UART TX pin", "hardware", 17, GPIO_OPTIONS),
    rw_enum(332, "uart_rx_pin", "UART RX pin", "hardware", 16, GPIO_OPTIONS),
    rw_enum(333, "can_tx_pin", "CAN TX pin", "hardware", 4, GPIO_OPTIONS),
    rw_enum(334, "can_rx_pin", "CAN RX pin", "hardware", 5, GPIO_OPTIONS),
    rw_enum(335, "status_led_pin", "Status LED pin", "hardware", 18, GPIO_OPTIONS),
    rw_u16(336, "watchdog_timeout_s", "Watchdog timeout", "s", "hardware", 1.0, 1, 3_600, 1, 30),
    rw_enum(337, "factory_reset_enable", "Factory reset enable", "hardware", 0, BOOL_OPTIONS),
    rw_enum(338, "event_log_overwrite_mode", "Event log overwrite mode", "hardware", 1, EVENT_LOG_OVERWRITE_OPTIONS),
    rw_u16(339, "serial_response_timeout_ms", "Serial response timeout", "ms", "hardware", 1.0, 10, 5_000, 1, 200),
    rw_u16(340, "serial_retry_count", "Serial retry count", "", "hardware", 1.0, 0, 10, 1, 1),
    rw_u16(341, "persist_interval_s", "NVS persist interval", "s", "hardware", 1.0, 1, 3_600, 1, 60),
    rw_enum(342, "firmware_update_enable", "Firmware update enable", "hardware", 0, BOOL_OPTIONS),
    rw_u16(343, "reserved_spare", "Reserved", "", "hardware", 1.0, 0, 0xFFFF, 1, 0),
];

/// Version block (500–509): the first four words are each packed as
/// `{major, minor}`; the remaining six plain words carry the 96-bit
/// serial number.
pub const VERSION: &[RegisterDescriptor] = &[
    packed_major_minor(500, "hardware_version", "Hardware version", "version"),
    packed_major_minor(501, "firmware_version", "Firmware version", "version"),
    packed_major_minor(502, "bootloader_version", "Bootloader version", "version"),
    packed_major_minor(503, "profile_version", "Profile version", "version"),
    ro_u16(504, "serial_word_0", "Serial number word 0", "", "version", 1.0),
    ro_u16(505, "serial_word_1", "Serial number word 1", "", "version", 1.0),
    ro_u16(506, "serial_word_2", "Serial number word 2", "", "version", 1.0),
    ro_u16(507, "serial_word_3", "Serial number word 3", "", "version", 1.0),
    ro_u16(508, "serial_word_4", "Serial number word 4", "", "version", 1.0),
    ro_u16(509, "serial_word_5", "Serial number word 5", "", "version", 1.0),
];

/// Number of event-log slots (addresses 200–297, two words each).
pub const EVENT_LOG_SLOTS: u16 = 49;
pub const EVENT_LOG_BASE: u16 = 200;

/// Build the 49 event-log descriptor pairs. Each slot is a 24-bit timestamp
/// (low word) and a packed high-byte-of-timestamp/event-id word.
pub const fn event_log_entries() -> [RegisterDescriptor; 98] {
    const TS_HI_FIELD: PackedField = PackedField { name: "ts_hi", lo_bit: 0, hi_bit: 7, signed: false, scale: 1.0, enum_table: None };
    const EVENT_ID_FIELD: PackedField = PackedField { name: "event_id", lo_bit: 8, hi_bit: 15, signed: false, scale: 1.0, enum_table: None };
    static FIELDS: [PackedField; 2] = [TS_HI_FIELD, EVENT_ID_FIELD];

    let mut out = [ro_u16(0, "event_ts_lo", "Event timestamp (low)", "s", "event_log", 1.0); 98];
    let mut i = 0;
    while i < EVENT_LOG_SLOTS as usize {
        let base = EVENT_LOG_BASE + (i as u16) * 2;
        out[i * 2] = RegisterDescriptor {
            address: base,
            key: "event_ts_lo",
            label: "Event timestamp (low)",
            unit: "s",
            group: "event_log",
            ..out[i * 2]
        };
        out[i * 2 + 1] = RegisterDescriptor {
            address: base + 1,
            key: "event_ts_hi_and_id",
            label: "Event timestamp high / event id",
            unit: "",
            group: "event_log",
            ty: RegisterType::Packed,
            access: Access::Ro,
            scale: 1.0,
            precision: 0,
            min_raw: None,
            max_raw: None,
            step: None,
            default_raw: 0,
            enum_table: None,
            packed_fields: Some(&FIELDS),
            special_raw: None,
        };
        i += 1;
    }
    out
}

/// All descriptors that every process should validate and index by address.
/// Assembled once; callers that need O(1) address lookup should build their
/// own index (e.g. a `HashMap`/`BTreeMap`) from this slice at startup.
pub fn all_descriptors() -> heapless::Vec<RegisterDescriptor, 256> {
    let mut v: heapless::Vec<RegisterDescriptor, 256> = heapless::Vec::new();
    let event_log = event_log_entries();
    for d in LIVE_DATA.iter().chain(STATS).chain(SETTINGS).chain(VERSION).chain(event_log.iter()) {
        v.push(*d).expect("descriptor table exceeds static capacity");
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_descriptor_default_is_valid() {
        for d in all_descriptors() {
            assert!(d.default_is_valid(), "invalid default for {}", d.key);
        }
    }

    #[test]
    fn no_duplicate_addresses_in_static_tables() {
        let all = all_descriptors();
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a.address, b.address, "duplicate address {}", a.address);
            }
        }
    }

    #[test]
    fn event_log_has_49_slots_of_two_words() {
        let entries = event_log_entries();
        assert_eq!(entries.len(), 98);
        assert_eq!(entries[0].address, EVENT_LOG_BASE);
        assert_eq!(entries[97].address, EVENT_LOG_BASE + 97);
    }

    #[test]
    fn event_log_high_word_decodes_packed_fields() {
        let entries = event_log_entries();
        let hi_word_desc = &entries[1];
        assert_eq!(hi_word_desc.ty, RegisterType::Packed);
        let fields = hi_word_desc.packed_fields.unwrap();
        // timestamp high byte 0x12, event id 0x05
        let word: u16 = 0x0512;
        assert_eq!(fields[0].extract_raw(word), 0x12);
        assert_eq!(fields[1].extract_raw(word), 0x05);
    }

    #[test]
    fn version_block_decodes_major_minor_from_a_packed_word() {
        let hw = VERSION.iter().find(|d| d.key == "hardware_version").unwrap();
        assert_eq!(hw.ty, RegisterType::Packed);
        let fields = hw.packed_fields.unwrap();
        // major 2, minor 7 packed as 0x0207
        let word: u16 = 0x0207;
        assert_eq!(fields[0].extract_raw(word), 2);
        assert_eq!(fields[1].extract_raw(word), 7);
    }

    #[test]
    fn settings_block_covers_every_address_from_300_to_343() {
        let mut addrs: Vec<u16> = SETTINGS.iter().map(|d| d.address).collect();
        addrs.sort_unstable();
        let expected: Vec<u16> = (300..=343).collect();
        assert_eq!(addrs, expected);
    }

    #[test]
    fn gpio_pin_settings_are_enum_typed() {
        for key in ["uart_tx_pin", "uart_rx_pin", "can_tx_pin", "can_rx_pin", "status_led_pin"] {
            let d = SETTINGS.iter().find(|d| d.key == key).unwrap();
            assert_eq!(d.ty, RegisterType::Enum, "{key} should be enum-typed");
        }
    }
}
