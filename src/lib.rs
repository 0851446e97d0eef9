//! Library for producing and interpreting marking programs for galvanometer
//! laser scanners.
//!
//! A marking program is the unit of work a scanner control board executes: an
//! ordered stream of motion, timing, and I/O instructions, plus a table of
//! per-layer timing/power parameters the geometry instructions reference. This
//! crate contains the compiler for such programs -- the [`output::Builder`]
//! assembles an instruction stream under a set of geometric transforms and a
//! 3D focal-height correction, and serializes the result to a binary artifact
//! -- and the matching zero-copy reader in [`input`].
//!
//! The binary format is this crate's own: a little-endian header, a layer
//! parameter table, a fixed-width instruction table, and a trailing data
//! section holding per-instruction point arrays. It round-trips through
//! [`input::parse_file`] but makes no claim of compatibility with any vendor
//! firmware format.
//!
//! # Module organization
//!
//! - [`model`] -- value types: positions, layer parameters, instructions.
//! - [`transform`] -- the offset/rotation stack applied to incoming geometry.
//! - [`correction`] -- the polynomial focal-height correction surface.
//! - [`output`] -- the program builder and serializer.
//! - [`input`] -- the zero-copy program reader.
//!
//! This root module defines the wire-level representation shared by `input`
//! and `output`: every on-disk record is a `zerocopy`-derived struct of
//! explicitly little-endian fields, so files can be read by reference without
//! a deserialization pass.

use num_derive::FromPrimitive;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub mod correction;
pub mod input;
pub mod model;
pub mod output;
pub mod transform;

/// Little-endian `u16` for wire structs.
pub type U16LE = zerocopy::byteorder::U16<byteorder::LE>;
/// Little-endian `u32` for wire structs.
pub type U32LE = zerocopy::byteorder::U32<byteorder::LE>;
/// Little-endian `f32` for wire structs.
pub type F32LE = zerocopy::byteorder::F32<byteorder::LE>;
/// Little-endian `f64` for wire structs.
pub type F64LE = zerocopy::byteorder::F64<byteorder::LE>;

/// File magic: `UDM1` interpreted as a little-endian `u32`.
pub const MAGIC: u32 = 0x314d_4455;
/// Current format revision.
pub const VERSION: u32 = 1;

/// Number of opto-isolated input lines on supported boards. Input-wait
/// instructions may reference indices `0..INPUT_LINE_COUNT`.
pub const INPUT_LINE_COUNT: u32 = 14;
/// Number of output lines addressable per output bus.
pub const OUTPUT_LINE_COUNT: u32 = 16;

/// Errors produced by the program builder and serializer.
///
/// Every kind except [`Error::Io`] indicates a defect in the calling code and
/// is not worth retrying; `Io` surfaces a persistence failure that the caller
/// may retry. No error leaves the program partially mutated.
#[derive(Debug, Error)]
pub enum Error {
    /// A numeric or index argument was outside its documented range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation was called outside the scope that permits it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Geometry referenced configuration (a layer index) that does not exist.
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),
    /// Persistent-storage write failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// First record in every file.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct MagicHeader {
    /// Must equal [`MAGIC`].
    pub magic: U32LE,
    /// Must equal [`VERSION`].
    pub version: U32LE,
}

/// Fixed-position file header, directly after the [`MagicHeader`].
///
/// Holds the program-wide configuration and the offset/count pairs locating
/// the variable-length sections. Offsets are absolute file positions.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct FileHeader {
    /// Electrical protocol, per [`model::Protocol`].
    pub protocol: U32LE,
    /// 2D/3D marking, per [`model::Dimension`].
    pub dimension: U32LE,

    /// Skywriting enable (0/1).
    pub sky_writing_enable: U32LE,
    /// Skywriting shape mode.
    pub sky_writing_mode: U32LE,
    /// Skywriting uniform-velocity length, mm.
    pub sky_writing_uniform_len: F32LE,
    /// Skywriting acceleration length, mm.
    pub sky_writing_acc_len: F32LE,
    /// Corner angle limit below which skywriting engages, degrees.
    pub sky_writing_angle_limit: F32LE,

    /// Jump extension length, mm.
    pub jump_extend_len: F32LE,
    /// Hold power after end of mark, percent.
    pub end_power: F32LE,

    /// Closed-loop galvo control enable (0/1).
    pub close_loop_enable: U32LE,
    /// Galvo model selector for closed-loop control.
    pub galvo_type: U32LE,
    /// Following-error threshold before the board halts.
    pub follow_error_max: U32LE,
    /// Consecutive samples over threshold before the board halts.
    pub follow_error_count: U32LE,

    /// Foot trigger enable (0/1).
    pub foot_trigger_enable: U32LE,
    /// Delay from trigger to mark start, ms.
    pub foot_trigger_delay_ms: U32LE,
    /// Trigger edge mode, per [`model::TriggerEdge`].
    pub foot_trigger_edge: U32LE,

    /// Coordinate offset active at the end of compilation, mm.
    pub offset: [F32LE; 3],
    /// Rotation angle active at the end of compilation, degrees.
    pub rotate_angle: F32LE,
    /// Rotation center (x, y), mm.
    pub rotate_center: [F32LE; 2],

    /// Calibration-plane focal height for the correction surface, mm.
    pub base_focal: F32LE,
    /// File offset of the correction coefficient array (`F64LE` each).
    pub correction_offset: U32LE,
    /// Number of correction coefficients.
    pub correction_count: U32LE,

    /// File offset of the layer parameter table.
    pub layer_table_offset: U32LE,
    /// Number of [`LayerRecord`]s in the layer table.
    pub layer_count: U32LE,

    /// File offset of the instruction table.
    pub instruction_table_offset: U32LE,
    /// Number of [`InstrRecord`]s in the instruction table.
    pub instruction_count: U32LE,
}

/// One layer parameter table entry.
///
/// Wire counterpart of [`model::MarkParameter`]; field order is frozen.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct LayerRecord {
    /// Marking speed, mm/s.
    pub mark_speed: U32LE,
    /// Jump speed, mm/s.
    pub jump_speed: U32LE,
    /// Mark delay, microseconds.
    pub mark_delay_us: U32LE,
    /// Jump delay, microseconds.
    pub jump_delay_us: U32LE,
    /// Polygon (corner) delay, microseconds.
    pub polygon_delay_us: U32LE,
    /// Number of times geometry on this layer is marked.
    pub mark_count: U32LE,
    /// Laser-on delay, microseconds.
    pub laser_on_delay_us: F32LE,
    /// Laser-off delay, microseconds.
    pub laser_off_delay_us: F32LE,
    /// First-pulse-suppression delay, microseconds.
    pub fpk_delay_us: F32LE,
    /// First-pulse-suppression length, microseconds.
    pub fpk_length_us: F32LE,
    /// Q-switch delay, microseconds.
    pub q_delay_us: F32LE,
    /// Marking duty cycle, 0..=1.
    pub duty_cycle: F32LE,
    /// Marking frequency, kHz.
    pub frequency_khz: F32LE,
    /// Standby Q frequency, kHz.
    pub standby_frequency_khz: F32LE,
    /// Standby duty cycle, 0..=1.
    pub standby_duty_cycle: F32LE,
    /// Laser power, percent of full scale.
    pub laser_power_pct: F32LE,
    /// Nonzero when laser power is driven by the analog output.
    pub analog_mode: U32LE,
    /// SPI laser waveform index, 0..=63.
    pub waveform: U32LE,
    /// Nonzero when MOPA pulse-width control is enabled.
    pub pulse_width_mode: U32LE,
    /// MOPA pulse width, nanoseconds.
    pub pulse_width_ns: U32LE,
}

/// One point in an instruction's data section.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct PosRecord {
    /// X coordinate, mm.
    pub x: F32LE,
    /// Y coordinate, mm.
    pub y: F32LE,
    /// Z (focal axis) coordinate, mm.
    pub z: F32LE,
    /// Auxiliary rotation axis value.
    pub a: F32LE,
}

/// Fixed-width instruction table entry.
///
/// The meaning of `flags`, `word`, and `args` depends on `opcode`; see
/// [`Opcode`]. Instructions carrying a point array store it in the data
/// section and reference it through `data_offset`/`data_len`.
#[derive(FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct InstrRecord {
    /// Discriminant, per [`Opcode`].
    pub opcode: U16LE,
    /// Per-opcode flag bits; see the `FLAG_*` constants.
    pub flags: U16LE,
    /// Per-opcode integer operand (layer index, bitmask, line index,
    /// repeat count, or jump target address).
    pub word: U32LE,
    /// Per-opcode float operands.
    pub args: [F32LE; 5],
    /// Absolute file offset of this instruction's point array, or 0.
    pub data_offset: U32LE,
    /// Byte length of this instruction's point array, or 0.
    pub data_len: U32LE,
}

/// Boolean operand bit: guide laser on, or output line driven high.
pub const FLAG_ON: u16 = 1 << 0;
/// Output instruction addresses the GMC4 bus rather than the standard bus.
pub const FLAG_GMC4: u16 = 1 << 1;
/// Polyline carries 3D geometry (z is meaningful).
pub const FLAG_3D: u16 = 1 << 2;

/// Instruction discriminants as stored in [`InstrRecord::opcode`].
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum Opcode {
    /// Move without marking. `args[0..4]` = x, y, z, a.
    Jump = 0x01,
    /// Pause execution. `args[0]` = milliseconds.
    Wait = 0x02,
    /// Switch the visible guide laser. `flags & FLAG_ON` = enable.
    GuideLaser = 0x03,
    /// Block until an input line asserts. `word` = line index.
    WaitInput = 0x04,
    /// Drive a whole output bus. `word` = bitmask, `flags & FLAG_GMC4` = bus.
    SetOutputs = 0x05,
    /// Drive one output line. `word` = index, `flags` = level and bus.
    SetOutput = 0x06,
    /// Set both analog outputs. `args[0..2]` = channel fractions.
    SetAnalog = 0x07,
    /// Mark a polyline. `word` = layer, `flags & FLAG_3D` = dimensionality,
    /// point array in the data section.
    Polyline = 0x08,
    /// Dwell-mark one point. `word` = layer, `args[0..4]` = x, y, z, a,
    /// `args[4]` = dwell milliseconds.
    Point = 0x09,
    /// Polyline that was chord-subdivided and height-corrected at compile
    /// time. `word` = layer, `args[0]` = maximum point gap, point array in
    /// the data section.
    CorrectedPolyline = 0x0a,
    /// Loop start marker. `word` = iteration count.
    RepeatStart = 0x0b,
    /// Loop end; jumps back. `word` = instruction address of the matching
    /// [`Opcode::RepeatStart`].
    RepeatEnd = 0x0c,
}
