//! High-level value types compiled into marking programs.

use num_derive::FromPrimitive;

use crate::{Error, LayerRecord, F32LE, U32LE};

/// A scanner-field position: x/y in the marking plane, z along the focal
/// axis, and an auxiliary rotation-axis value `a`. Millimeters throughout.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub a: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32, a: f32) -> Self {
        Position { x, y, z, a }
    }

    /// Straight-line distance to `other`, ignoring the auxiliary axis.
    pub fn distance(&self, other: &Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Electrical protocol between the control board and the scan head.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Protocol {
    /// Serial SPI protocol.
    Spi = 0,
    /// XY2-100 parallel protocol.
    Xy2_100 = 1,
    /// SL2-100 enhanced protocol.
    Sl2 = 2,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Spi
    }
}

/// Whether geometry carries a meaningful focal (z) axis.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Dimension {
    TwoD = 0,
    ThreeD = 1,
}

impl Default for Dimension {
    fn default() -> Self {
        Dimension::TwoD
    }
}

/// Which of the two independent output buses an output instruction drives.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum OutputBus {
    /// The board's standard output bank.
    Standard = 0,
    /// The GMC4 expansion output bank.
    Gmc4 = 1,
}

/// Foot trigger firing mode.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TriggerEdge {
    /// Fire once per rising edge.
    Rising = 0,
    /// Fire while the input is held.
    Level = 1,
}

/// Skywriting configuration: extends the beam path past geometric corners so
/// the mirrors hold velocity before the laser switches on.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SkyWriting {
    pub enable: bool,
    /// Shape mode selector; firmware-defined.
    pub mode: u32,
    /// Length of the constant-velocity run-in, mm.
    pub uniform_len: f32,
    /// Length of the acceleration ramp, mm.
    pub acc_len: f32,
    /// Corner angle (degrees) below which skywriting engages.
    pub angle_limit: f32,
}

/// Closed-loop galvo control settings.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CloseLoop {
    pub enable: bool,
    /// Galvo model selector; firmware-defined.
    pub galvo_type: u32,
    /// Following-error threshold before the board halts.
    pub follow_error_max: u32,
    /// Consecutive over-threshold samples before the board halts.
    pub follow_error_count: u32,
}

/// Foot trigger settings. `None` on the builder means foot triggering is off.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FootTrigger {
    /// Delay from trigger to mark start, ms.
    pub delay_ms: u32,
    pub edge: TriggerEdge,
}

/// Timing and power parameters for one layer.
///
/// Geometry instructions reference these by index into the layer table. The
/// documented ranges (duty cycles 0..=1, power 0..=100, waveform 0..=63) are
/// enforced by [`MarkParameter::validate`] when the table is installed;
/// out-of-range values are rejected rather than clamped so misconfiguration
/// surfaces at the call site.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarkParameter {
    /// Marking speed, mm/s.
    pub mark_speed: u32,
    /// Jump speed, mm/s.
    pub jump_speed: u32,
    /// Mark delay, us.
    pub mark_delay_us: u32,
    /// Jump delay, us.
    pub jump_delay_us: u32,
    /// Polygon (corner) delay, us.
    pub polygon_delay_us: u32,
    /// Number of marking passes for geometry on this layer.
    pub mark_count: u32,
    /// Laser-on delay, us.
    pub laser_on_delay_us: f32,
    /// Laser-off delay, us.
    pub laser_off_delay_us: f32,
    /// First-pulse-suppression delay, us.
    pub fpk_delay_us: f32,
    /// First-pulse-suppression length, us.
    pub fpk_length_us: f32,
    /// Q-switch delay, us.
    pub q_delay_us: f32,
    /// Marking duty cycle, 0..=1.
    pub duty_cycle: f32,
    /// Marking frequency, kHz.
    pub frequency_khz: f32,
    /// Standby Q frequency, kHz.
    pub standby_frequency_khz: f32,
    /// Standby duty cycle, 0..=1.
    pub standby_duty_cycle: f32,
    /// Laser power, percent (0..=100).
    pub laser_power_pct: f32,
    /// Drive laser power from the analog output instead of PWM.
    pub analog_mode: bool,
    /// SPI laser waveform index, 0..=63.
    pub waveform: u32,
    /// Enable MOPA pulse-width control.
    pub pulse_width_mode: bool,
    /// MOPA pulse width, ns.
    pub pulse_width_ns: u32,
}

impl Default for MarkParameter {
    fn default() -> Self {
        MarkParameter {
            mark_speed: 1000,
            jump_speed: 3000,
            mark_delay_us: 100,
            jump_delay_us: 100,
            polygon_delay_us: 50,
            mark_count: 1,
            laser_on_delay_us: 0.0,
            laser_off_delay_us: 0.0,
            fpk_delay_us: 0.0,
            fpk_length_us: 0.0,
            q_delay_us: 0.0,
            duty_cycle: 0.5,
            frequency_khz: 20.0,
            standby_frequency_khz: 20.0,
            standby_duty_cycle: 0.01,
            laser_power_pct: 50.0,
            analog_mode: false,
            waveform: 0,
            pulse_width_mode: false,
            pulse_width_ns: 0,
        }
    }
}

impl MarkParameter {
    /// Checks the documented field ranges.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.duty_cycle) {
            return Err(Error::InvalidArgument(format!(
                "duty cycle {} outside 0..=1",
                self.duty_cycle
            )));
        }
        if !(0.0..=1.0).contains(&self.standby_duty_cycle) {
            return Err(Error::InvalidArgument(format!(
                "standby duty cycle {} outside 0..=1",
                self.standby_duty_cycle
            )));
        }
        if !(0.0..=100.0).contains(&self.laser_power_pct) {
            return Err(Error::InvalidArgument(format!(
                "laser power {}% outside 0..=100",
                self.laser_power_pct
            )));
        }
        if self.waveform > 63 {
            return Err(Error::InvalidArgument(format!(
                "waveform index {} outside 0..=63",
                self.waveform
            )));
        }
        Ok(())
    }
}

impl From<&MarkParameter> for LayerRecord {
    fn from(p: &MarkParameter) -> Self {
        LayerRecord {
            mark_speed: U32LE::new(p.mark_speed),
            jump_speed: U32LE::new(p.jump_speed),
            mark_delay_us: U32LE::new(p.mark_delay_us),
            jump_delay_us: U32LE::new(p.jump_delay_us),
            polygon_delay_us: U32LE::new(p.polygon_delay_us),
            mark_count: U32LE::new(p.mark_count),
            laser_on_delay_us: F32LE::new(p.laser_on_delay_us),
            laser_off_delay_us: F32LE::new(p.laser_off_delay_us),
            fpk_delay_us: F32LE::new(p.fpk_delay_us),
            fpk_length_us: F32LE::new(p.fpk_length_us),
            q_delay_us: F32LE::new(p.q_delay_us),
            duty_cycle: F32LE::new(p.duty_cycle),
            frequency_khz: F32LE::new(p.frequency_khz),
            standby_frequency_khz: F32LE::new(p.standby_frequency_khz),
            standby_duty_cycle: F32LE::new(p.standby_duty_cycle),
            laser_power_pct: F32LE::new(p.laser_power_pct),
            analog_mode: U32LE::new(p.analog_mode as u32),
            waveform: U32LE::new(p.waveform),
            pulse_width_mode: U32LE::new(p.pulse_width_mode as u32),
            pulse_width_ns: U32LE::new(p.pulse_width_ns),
        }
    }
}

impl From<&LayerRecord> for MarkParameter {
    fn from(r: &LayerRecord) -> Self {
        MarkParameter {
            mark_speed: r.mark_speed.get(),
            jump_speed: r.jump_speed.get(),
            mark_delay_us: r.mark_delay_us.get(),
            jump_delay_us: r.jump_delay_us.get(),
            polygon_delay_us: r.polygon_delay_us.get(),
            mark_count: r.mark_count.get(),
            laser_on_delay_us: r.laser_on_delay_us.get(),
            laser_off_delay_us: r.laser_off_delay_us.get(),
            fpk_delay_us: r.fpk_delay_us.get(),
            fpk_length_us: r.fpk_length_us.get(),
            q_delay_us: r.q_delay_us.get(),
            duty_cycle: r.duty_cycle.get(),
            frequency_khz: r.frequency_khz.get(),
            standby_frequency_khz: r.standby_frequency_khz.get(),
            standby_duty_cycle: r.standby_duty_cycle.get(),
            laser_power_pct: r.laser_power_pct.get(),
            analog_mode: r.analog_mode.get() != 0,
            waveform: r.waveform.get(),
            pulse_width_mode: r.pulse_width_mode.get() != 0,
            pulse_width_ns: r.pulse_width_ns.get(),
        }
    }
}

/// One node in a compiled program body.
///
/// Instructions are append-only and addressed by their 0-based position in
/// the stream. Geometry variants hold positions as they were compiled, i.e.
/// after the coordinate transform (and, for
/// [`Instruction::CorrectedPolyline`], after chord subdivision and
/// focal-height correction).
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Move without marking.
    Jump(Position),
    /// Pause execution for the given number of milliseconds.
    Wait(f32),
    /// Switch the visible guide laser on or off.
    GuideLaser(bool),
    /// Block until the given input line asserts.
    WaitInput(u32),
    /// Drive a whole output bus from a bitmask.
    SetOutputs { mask: u32, bus: OutputBus },
    /// Drive a single output line.
    SetOutput {
        index: u32,
        level: bool,
        bus: OutputBus,
    },
    /// Set both analog output channels, as fractions of full scale.
    SetAnalog { a: f32, b: f32 },
    /// Mark a connected polyline with the given layer's parameters.
    Polyline {
        points: Vec<Position>,
        layer: usize,
        three_d: bool,
    },
    /// Dwell-mark a single point.
    Point {
        pos: Position,
        dwell_ms: f32,
        layer: usize,
    },
    /// Chord-subdivided, focal-height-corrected 3D polyline.
    CorrectedPolyline {
        points: Vec<Position>,
        max_gap: f32,
        layer: usize,
    },
    /// Loop start marker; the body repeats `count` times.
    RepeatStart { count: u32 },
    /// Loop end; execution jumps back to the instruction at `target`.
    RepeatEnd { target: u32 },
}

impl Instruction {
    /// Layer index this instruction references, if it marks geometry.
    pub fn layer(&self) -> Option<usize> {
        match self {
            Instruction::Polyline { layer, .. }
            | Instruction::Point { layer, .. }
            | Instruction::CorrectedPolyline { layer, .. } => Some(*layer),
            _ => None,
        }
    }
}
