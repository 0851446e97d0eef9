//! Builds marking programs and writes them out.
//!
//! [`Builder`] is the assembler: it owns one program's worth of state -- the
//! instruction stream, the layer parameter table, the active coordinate
//! transform, the correction surface, and the program-wide configuration --
//! and grows it through validated append calls. A finished program is
//! serialized with [`Builder::buffer`] or [`Builder::save_to_file`] and read
//! back with [`crate::input::parse_file`].
//!
//! # Lifecycle
//!
//! A builder starts fresh. [`Builder::open`] enters program scope;
//! instruction appends are only legal inside it. [`Builder::close`] ends the
//! scope, after which the program may be serialized. Serialization seals the
//! program: further mutation is rejected until [`Builder::reset`] discards
//! everything and starts over. Configuration setters may be called any time
//! before sealing and affect only instructions compiled afterwards.

use std::io;
use std::mem::size_of;
use std::path::Path;

use tracing::debug;
use zerocopy::AsBytes;

use crate::correction::CorrectionSurface;
use crate::model::{
    CloseLoop, Dimension, FootTrigger, Instruction, MarkParameter, OutputBus,
    Position, Protocol, SkyWriting, TriggerEdge,
};
use crate::transform::Transform;
use crate::{
    Error, FileHeader, InstrRecord, MagicHeader, Opcode, PosRecord, F32LE,
    F64LE, FLAG_3D, FLAG_GMC4, FLAG_ON, INPUT_LINE_COUNT, MAGIC,
    OUTPUT_LINE_COUNT, U16LE, U32LE, VERSION,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Scope {
    /// Created or reset; `open()` has not been called.
    Fresh,
    /// Inside the `open()`/`close()` bracket.
    Open,
    /// Closed and ready to serialize.
    Closed,
    /// Serialized; read-only until `reset()`.
    Sealed,
}

/// Assembles one marking program.
///
/// Not internally synchronized: a builder is owned by one producer at a time
/// and every mutating call takes `&mut self`.
#[derive(Clone, Debug)]
pub struct Builder {
    protocol: Protocol,
    dimension: Dimension,
    sky_writing: SkyWriting,
    jump_extend_len: f32,
    end_power: f32,
    close_loop: CloseLoop,
    foot_trigger: Option<FootTrigger>,

    transform: Transform,
    correction: CorrectionSurface,
    layers: Vec<MarkParameter>,
    instructions: Vec<Instruction>,

    /// Highest layer index any compiled instruction references, used to stop
    /// the table from shrinking underneath existing geometry.
    max_layer_referenced: Option<usize>,
    /// Addresses of repeat-start markers that have not been closed yet,
    /// innermost last.
    open_repeats: Vec<usize>,
    scope: Scope,
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl Builder {
    /// Creates an empty, unscoped builder.
    pub fn new() -> Self {
        Builder {
            protocol: Protocol::default(),
            dimension: Dimension::default(),
            sky_writing: SkyWriting::default(),
            jump_extend_len: 0.0,
            end_power: 0.0,
            close_loop: CloseLoop::default(),
            foot_trigger: None,
            transform: Transform::identity(),
            correction: CorrectionSurface::identity(),
            layers: Vec::new(),
            instructions: Vec::new(),
            max_layer_referenced: None,
            open_repeats: Vec::new(),
            scope: Scope::Fresh,
        }
    }

    /// Discards the current program and returns to the fresh state.
    pub fn reset(&mut self) {
        debug!("discarding program state");
        *self = Builder::new();
    }

    // ---- scope ----

    /// Enters program scope. Instructions may only be appended inside it.
    pub fn open(&mut self) -> Result<(), Error> {
        match self.scope {
            Scope::Fresh => {
                self.scope = Scope::Open;
                Ok(())
            }
            Scope::Open => Err(Error::InvalidState(
                "program scope is already open".to_string(),
            )),
            Scope::Closed | Scope::Sealed => Err(Error::InvalidState(
                "program already closed; reset() before reopening".to_string(),
            )),
        }
    }

    /// Ends program scope. Every repeat marker must be closed first.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.scope != Scope::Open {
            return Err(Error::InvalidState(
                "not in program scope".to_string(),
            ));
        }
        if let Some(&addr) = self.open_repeats.last() {
            return Err(Error::InvalidState(format!(
                "repeat started at address {} was never closed",
                addr
            )));
        }
        self.scope = Scope::Closed;
        Ok(())
    }

    fn require_open(&self) -> Result<(), Error> {
        if self.scope == Scope::Open {
            Ok(())
        } else {
            Err(Error::InvalidState("not in program scope".to_string()))
        }
    }

    fn require_mutable(&self) -> Result<(), Error> {
        if self.scope == Scope::Sealed {
            Err(Error::InvalidState(
                "program is sealed after serialization; reset() to start a new one"
                    .to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn require_serializable(&self) -> Result<(), Error> {
        match self.scope {
            Scope::Closed | Scope::Sealed => Ok(()),
            Scope::Fresh | Scope::Open => Err(Error::InvalidState(
                "program must be closed before serialization".to_string(),
            )),
        }
    }

    // ---- configuration ----

    /// Selects the scan-head protocol and marking dimensionality.
    pub fn set_protocol(
        &mut self,
        protocol: Protocol,
        dimension: Dimension,
    ) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        self.protocol = protocol;
        self.dimension = dimension;
        Ok(self)
    }

    /// Configures skywriting.
    pub fn set_sky_writing(&mut self, sw: SkyWriting) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        for (name, value) in [
            ("uniform length", sw.uniform_len),
            ("acceleration length", sw.acc_len),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "skywriting {} {} must be finite and non-negative",
                    name, value
                )));
            }
        }
        if !sw.angle_limit.is_finite() || !(0.0..=180.0).contains(&sw.angle_limit) {
            return Err(Error::InvalidArgument(format!(
                "skywriting angle limit {} outside 0..=180",
                sw.angle_limit
            )));
        }
        self.sky_writing = sw;
        Ok(self)
    }

    /// Sets the jump extension length in mm.
    pub fn set_jump_extend_len(&mut self, len: f32) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        if !len.is_finite() || len < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "jump extend length {} must be finite and non-negative",
                len
            )));
        }
        self.jump_extend_len = len;
        Ok(self)
    }

    /// Sets the hold power (percent) maintained after the mark finishes.
    pub fn set_end_power(&mut self, power: f32) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        if !(0.0..=100.0).contains(&power) {
            return Err(Error::InvalidArgument(format!(
                "end power {}% outside 0..=100",
                power
            )));
        }
        self.end_power = power;
        Ok(self)
    }

    /// Configures closed-loop galvo control.
    pub fn set_close_loop(&mut self, cl: CloseLoop) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        self.close_loop = cl;
        Ok(self)
    }

    /// Enables foot-trigger marking with the given start delay and edge mode.
    pub fn set_foot_trigger(
        &mut self,
        delay_ms: u32,
        edge: TriggerEdge,
    ) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        self.foot_trigger = Some(FootTrigger { delay_ms, edge });
        Ok(self)
    }

    /// Sets the coordinate offset applied to subsequently compiled geometry.
    pub fn set_offset(
        &mut self,
        dx: f32,
        dy: f32,
        dz: f32,
    ) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        if ![dx, dy, dz].iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidArgument(
                "coordinate offset must be finite".to_string(),
            ));
        }
        self.transform.set_offset(dx, dy, dz);
        Ok(self)
    }

    /// Sets the rotation (degrees about a center point) applied to
    /// subsequently compiled geometry.
    pub fn set_rotation(
        &mut self,
        angle_deg: f32,
        cx: f32,
        cy: f32,
    ) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        if ![angle_deg, cx, cy].iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidArgument(
                "rotation parameters must be finite".to_string(),
            ));
        }
        self.transform.set_rotation(angle_deg, cx, cy);
        Ok(self)
    }

    /// Installs the 3D correction surface used by
    /// [`Builder::add_break_and_correct_polyline`] and
    /// [`Builder::get_z_value`].
    pub fn set_correction(
        &mut self,
        base_focal: f32,
        coeffs: &[f64],
    ) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        self.correction = CorrectionSurface::new(base_focal, coeffs.to_vec())?;
        Ok(self)
    }

    /// Replaces the whole layer parameter table.
    ///
    /// Every record is validated first; on any failure the existing table is
    /// left untouched. The new table must still cover every layer index that
    /// compiled geometry already references.
    pub fn set_layers(&mut self, records: &[MarkParameter]) -> Result<&mut Self, Error> {
        self.require_mutable()?;
        for (i, record) in records.iter().enumerate() {
            record.validate().map_err(|e| match e {
                Error::InvalidArgument(msg) => {
                    Error::InvalidArgument(format!("layer {}: {}", i, msg))
                }
                other => other,
            })?;
        }
        if let Some(max) = self.max_layer_referenced {
            if records.len() <= max {
                return Err(Error::ConfigurationConflict(format!(
                    "table of {} entries would orphan compiled geometry on layer {}",
                    records.len(),
                    max
                )));
            }
        }
        self.layers = records.to_vec();
        Ok(self)
    }

    /// Evaluates the installed correction surface at a field position.
    pub fn get_z_value(&self, x: f32, y: f32, height: f32) -> f32 {
        self.correction.evaluate(x, y, height)
    }

    // ---- instruction appends ----

    /// Appends an unmarked move to `pos` (transform applied).
    pub fn add_jump(&mut self, pos: Position) -> Result<(), Error> {
        self.require_open()?;
        let pos = self.transform.apply(pos);
        self.instructions.push(Instruction::Jump(pos));
        Ok(())
    }

    /// Appends a pause of `ms` milliseconds.
    pub fn add_wait(&mut self, ms: f32) -> Result<(), Error> {
        self.require_open()?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "wait time {} ms must be finite and non-negative",
                ms
            )));
        }
        self.instructions.push(Instruction::Wait(ms));
        Ok(())
    }

    /// Appends a guide-laser switch.
    pub fn add_guide_laser(&mut self, enable: bool) -> Result<(), Error> {
        self.require_open()?;
        self.instructions.push(Instruction::GuideLaser(enable));
        Ok(())
    }

    /// Appends a wait for input line `index` to assert.
    pub fn add_input_wait(&mut self, index: u32) -> Result<(), Error> {
        self.require_open()?;
        if index >= INPUT_LINE_COUNT {
            return Err(Error::InvalidArgument(format!(
                "input line {} outside 0..{}",
                index, INPUT_LINE_COUNT
            )));
        }
        self.instructions.push(Instruction::WaitInput(index));
        Ok(())
    }

    /// Appends a whole-bus output write.
    pub fn add_outputs(&mut self, mask: u32, bus: OutputBus) -> Result<(), Error> {
        self.require_open()?;
        self.instructions.push(Instruction::SetOutputs { mask, bus });
        Ok(())
    }

    /// Appends a single-line output write.
    pub fn add_output(
        &mut self,
        index: u32,
        level: bool,
        bus: OutputBus,
    ) -> Result<(), Error> {
        self.require_open()?;
        if index >= OUTPUT_LINE_COUNT {
            return Err(Error::InvalidArgument(format!(
                "output line {} outside 0..{}",
                index, OUTPUT_LINE_COUNT
            )));
        }
        self.instructions
            .push(Instruction::SetOutput { index, level, bus });
        Ok(())
    }

    /// Appends an analog output write. Channel values are fractions of full
    /// scale: 0 is 0 V, 1 is full-scale voltage.
    pub fn add_analog(&mut self, a: f32, b: f32) -> Result<(), Error> {
        self.require_open()?;
        for (name, value) in [("A", a), ("B", b)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "analog channel {} value {} outside 0..=1",
                    name, value
                )));
            }
        }
        self.instructions.push(Instruction::SetAnalog { a, b });
        Ok(())
    }

    /// Appends a polyline on `layer`, transforming each point.
    pub fn add_polyline(
        &mut self,
        points: &[Position],
        layer: usize,
        three_d: bool,
    ) -> Result<(), Error> {
        self.require_open()?;
        self.check_layer(layer)?;
        if points.len() < 2 {
            return Err(Error::InvalidArgument(format!(
                "polyline needs at least 2 points, got {}",
                points.len()
            )));
        }
        let points = points.iter().map(|p| self.transform.apply(*p)).collect();
        self.instructions.push(Instruction::Polyline {
            points,
            layer,
            three_d,
        });
        self.note_layer(layer);
        Ok(())
    }

    /// Appends a single dwell-marked point on `layer`.
    pub fn add_point(
        &mut self,
        pos: Position,
        dwell_ms: f32,
        layer: usize,
    ) -> Result<(), Error> {
        self.require_open()?;
        self.check_layer(layer)?;
        if !dwell_ms.is_finite() || dwell_ms < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "dwell time {} ms must be finite and non-negative",
                dwell_ms
            )));
        }
        let pos = self.transform.apply(pos);
        self.instructions.push(Instruction::Point {
            pos,
            dwell_ms,
            layer,
        });
        self.note_layer(layer);
        Ok(())
    }

    /// Appends a polyline after chord subdivision and focal-height
    /// correction.
    ///
    /// Points are transformed first. Then any segment longer than `max_gap`
    /// is split into evenly spaced pieces no longer than `max_gap`. Finally
    /// every point -- original and inserted -- has its z recomputed as
    /// `correction.evaluate(x, y, z)`, with the pre-correction z acting as
    /// the work-plane height. Endpoint x/y coordinates are preserved exactly.
    pub fn add_break_and_correct_polyline(
        &mut self,
        points: &[Position],
        max_gap: f32,
        layer: usize,
    ) -> Result<(), Error> {
        self.require_open()?;
        self.check_layer(layer)?;
        if points.len() < 2 {
            return Err(Error::InvalidArgument(format!(
                "polyline needs at least 2 points, got {}",
                points.len()
            )));
        }
        if !max_gap.is_finite() || max_gap <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "maximum point gap {} must be positive",
                max_gap
            )));
        }
        let transformed: Vec<Position> =
            points.iter().map(|p| self.transform.apply(*p)).collect();
        let mut dense = subdivide(&transformed, max_gap);
        for p in &mut dense {
            p.z = self.correction.evaluate(p.x, p.y, p.z);
        }
        self.instructions.push(Instruction::CorrectedPolyline {
            points: dense,
            max_gap,
            layer,
        });
        self.note_layer(layer);
        Ok(())
    }

    /// Appends a repeat-start marker and returns its instruction address.
    ///
    /// The body between this marker and the matching [`Builder::end_repeat`]
    /// executes `count` times. Repeats may nest.
    pub fn begin_repeat(&mut self, count: u32) -> Result<usize, Error> {
        self.require_open()?;
        if count < 1 {
            return Err(Error::InvalidArgument(
                "repeat count must be at least 1".to_string(),
            ));
        }
        let addr = self.instructions.len();
        self.instructions.push(Instruction::RepeatStart { count });
        self.open_repeats.push(addr);
        Ok(addr)
    }

    /// Closes the repeat started at `start_address`.
    ///
    /// Must close the innermost unmatched marker; closing an outer repeat
    /// while an inner one is still open is rejected.
    pub fn end_repeat(&mut self, start_address: usize) -> Result<(), Error> {
        self.require_open()?;
        match self.open_repeats.last() {
            Some(&innermost) if innermost == start_address => {
                self.open_repeats.pop();
                self.instructions.push(Instruction::RepeatEnd {
                    target: start_address as u32,
                });
                Ok(())
            }
            Some(&innermost) if self.open_repeats.contains(&start_address) => {
                Err(Error::InvalidState(format!(
                    "repeat at address {} cannot close before inner repeat at {}",
                    start_address, innermost
                )))
            }
            _ => Err(Error::InvalidState(format!(
                "no unmatched repeat start at address {}",
                start_address
            ))),
        }
    }

    fn check_layer(&self, layer: usize) -> Result<(), Error> {
        if layer >= self.layers.len() {
            return Err(Error::ConfigurationConflict(format!(
                "layer index {} out of range for table of {} entries",
                layer,
                self.layers.len()
            )));
        }
        Ok(())
    }

    fn note_layer(&mut self, layer: usize) {
        self.max_layer_referenced =
            Some(self.max_layer_referenced.map_or(layer, |m| m.max(layer)));
    }

    // ---- accessors ----

    /// Compiled instruction stream, in program order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Current layer parameter table.
    pub fn layers(&self) -> &[MarkParameter] {
        &self.layers
    }

    /// Active coordinate transform.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Installed correction surface.
    pub fn correction(&self) -> &CorrectionSurface {
        &self.correction
    }

    // ---- serialization ----

    /// Serializes the closed program into an exactly-sized byte buffer and
    /// seals the builder.
    pub fn buffer(&mut self) -> Result<Vec<u8>, Error> {
        self.require_serializable()?;
        let mut cursor = io::Cursor::new(Vec::new());
        self.encode(&mut cursor)?;
        self.scope = Scope::Sealed;
        let bytes = cursor.into_inner();
        debug!(
            instructions = self.instructions.len(),
            layers = self.layers.len(),
            bytes = bytes.len(),
            "serialized marking program"
        );
        Ok(bytes)
    }

    /// Writes the closed program to `path` and seals the builder.
    ///
    /// The bytes are identical to what [`Builder::buffer`] returns. The file
    /// is staged in a temporary sibling and renamed into place, so readers
    /// never observe a partial write.
    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.require_serializable()?;
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        self.encode(tmp.as_file_mut())?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        self.scope = Scope::Sealed;
        debug!(path = %path.display(), "wrote marking program");
        Ok(())
    }

    /// Gathers up the program and generates a file thru `out`.
    ///
    /// Layout: magic header, file header, correction coefficients, layer
    /// table, instruction table, then the data section holding point arrays.
    /// The file header and instruction table are backfilled once the offsets
    /// they reference are known.
    fn encode(&self, mut out: impl io::Write + io::Seek) -> io::Result<()> {
        out.seek(io::SeekFrom::Start(0))?;
        let magic_header = MagicHeader {
            magic: U32LE::new(MAGIC),
            version: U32LE::new(VERSION),
        };
        out.write_all(magic_header.as_bytes())?;

        // Leave a hole for the file header.
        out.seek(io::SeekFrom::Current(size_of::<FileHeader>() as i64))?;

        // Correction coefficients.
        let correction_offset = stream_position(&mut out)?;
        for k in self.correction.coeffs() {
            out.write_all(F64LE::new(*k).as_bytes())?;
        }

        // Layer table.
        let layer_table_offset = stream_position(&mut out)?;
        for layer in &self.layers {
            out.write_all(crate::LayerRecord::from(layer).as_bytes())?;
        }

        // Leave a hole for the instruction table, then write the data
        // section, collecting each instruction's record as its data lands.
        let instruction_table_offset = stream_position(&mut out)?;
        out.seek(io::SeekFrom::Current(
            (size_of::<InstrRecord>() * self.instructions.len()) as i64,
        ))?;

        let mut records = Vec::with_capacity(self.instructions.len());
        for instr in &self.instructions {
            let mut record = encode_instruction(instr);
            if let Some(points) = instruction_points(instr) {
                let data_offset = stream_position(&mut out)?;
                for p in points {
                    let rec = PosRecord {
                        x: F32LE::new(p.x),
                        y: F32LE::new(p.y),
                        z: F32LE::new(p.z),
                        a: F32LE::new(p.a),
                    };
                    out.write_all(rec.as_bytes())?;
                }
                record.data_offset = U32LE::new(data_offset as u32);
                record.data_len =
                    U32LE::new((points.len() * size_of::<PosRecord>()) as u32);
            }
            records.push(record);
        }

        // Seek back and emit the instruction table.
        out.seek(io::SeekFrom::Start(instruction_table_offset))?;
        for record in &records {
            out.write_all(record.as_bytes())?;
        }

        // Backfill the file header.
        out.seek(io::SeekFrom::Start(size_of::<MagicHeader>() as u64))?;
        let ft = self.foot_trigger;
        let header = FileHeader {
            protocol: U32LE::new(self.protocol as u32),
            dimension: U32LE::new(self.dimension as u32),
            sky_writing_enable: U32LE::new(self.sky_writing.enable as u32),
            sky_writing_mode: U32LE::new(self.sky_writing.mode),
            sky_writing_uniform_len: F32LE::new(self.sky_writing.uniform_len),
            sky_writing_acc_len: F32LE::new(self.sky_writing.acc_len),
            sky_writing_angle_limit: F32LE::new(self.sky_writing.angle_limit),
            jump_extend_len: F32LE::new(self.jump_extend_len),
            end_power: F32LE::new(self.end_power),
            close_loop_enable: U32LE::new(self.close_loop.enable as u32),
            galvo_type: U32LE::new(self.close_loop.galvo_type),
            follow_error_max: U32LE::new(self.close_loop.follow_error_max),
            follow_error_count: U32LE::new(self.close_loop.follow_error_count),
            foot_trigger_enable: U32LE::new(ft.is_some() as u32),
            foot_trigger_delay_ms: U32LE::new(ft.map_or(0, |t| t.delay_ms)),
            foot_trigger_edge: U32LE::new(ft.map_or(0, |t| t.edge as u32)),
            offset: {
                let o = self.transform.offset();
                [F32LE::new(o[0]), F32LE::new(o[1]), F32LE::new(o[2])]
            },
            rotate_angle: F32LE::new(self.transform.angle_deg()),
            rotate_center: {
                let c = self.transform.center();
                [F32LE::new(c[0]), F32LE::new(c[1])]
            },
            base_focal: F32LE::new(self.correction.base_focal()),
            correction_offset: U32LE::new(correction_offset as u32),
            correction_count: U32LE::new(self.correction.coeffs().len() as u32),
            layer_table_offset: U32LE::new(layer_table_offset as u32),
            layer_count: U32LE::new(self.layers.len() as u32),
            instruction_table_offset: U32LE::new(instruction_table_offset as u32),
            instruction_count: U32LE::new(self.instructions.len() as u32),
        };
        out.write_all(header.as_bytes())?;

        Ok(())
    }
}

fn stream_position(out: &mut impl io::Seek) -> io::Result<u64> {
    out.seek(io::SeekFrom::Current(0))
}

/// Maps an instruction to its fixed-width record, leaving `data_offset` and
/// `data_len` for the caller to fill when a point array is attached.
fn encode_instruction(instr: &Instruction) -> InstrRecord {
    let mut r = InstrRecord::default();
    match instr {
        Instruction::Jump(p) => {
            r.opcode = U16LE::new(Opcode::Jump as u16);
            r.args[0] = F32LE::new(p.x);
            r.args[1] = F32LE::new(p.y);
            r.args[2] = F32LE::new(p.z);
            r.args[3] = F32LE::new(p.a);
        }
        Instruction::Wait(ms) => {
            r.opcode = U16LE::new(Opcode::Wait as u16);
            r.args[0] = F32LE::new(*ms);
        }
        Instruction::GuideLaser(enable) => {
            r.opcode = U16LE::new(Opcode::GuideLaser as u16);
            r.flags = U16LE::new(if *enable { FLAG_ON } else { 0 });
        }
        Instruction::WaitInput(index) => {
            r.opcode = U16LE::new(Opcode::WaitInput as u16);
            r.word = U32LE::new(*index);
        }
        Instruction::SetOutputs { mask, bus } => {
            r.opcode = U16LE::new(Opcode::SetOutputs as u16);
            r.flags = U16LE::new(bus_flag(*bus));
            r.word = U32LE::new(*mask);
        }
        Instruction::SetOutput { index, level, bus } => {
            r.opcode = U16LE::new(Opcode::SetOutput as u16);
            let mut flags = bus_flag(*bus);
            if *level {
                flags |= FLAG_ON;
            }
            r.flags = U16LE::new(flags);
            r.word = U32LE::new(*index);
        }
        Instruction::SetAnalog { a, b } => {
            r.opcode = U16LE::new(Opcode::SetAnalog as u16);
            r.args[0] = F32LE::new(*a);
            r.args[1] = F32LE::new(*b);
        }
        Instruction::Polyline { layer, three_d, .. } => {
            r.opcode = U16LE::new(Opcode::Polyline as u16);
            r.flags = U16LE::new(if *three_d { FLAG_3D } else { 0 });
            r.word = U32LE::new(*layer as u32);
        }
        Instruction::Point {
            pos,
            dwell_ms,
            layer,
        } => {
            r.opcode = U16LE::new(Opcode::Point as u16);
            r.word = U32LE::new(*layer as u32);
            r.args[0] = F32LE::new(pos.x);
            r.args[1] = F32LE::new(pos.y);
            r.args[2] = F32LE::new(pos.z);
            r.args[3] = F32LE::new(pos.a);
            r.args[4] = F32LE::new(*dwell_ms);
        }
        Instruction::CorrectedPolyline {
            max_gap, layer, ..
        } => {
            r.opcode = U16LE::new(Opcode::CorrectedPolyline as u16);
            r.word = U32LE::new(*layer as u32);
            r.args[0] = F32LE::new(*max_gap);
        }
        Instruction::RepeatStart { count } => {
            r.opcode = U16LE::new(Opcode::RepeatStart as u16);
            r.word = U32LE::new(*count);
        }
        Instruction::RepeatEnd { target } => {
            r.opcode = U16LE::new(Opcode::RepeatEnd as u16);
            r.word = U32LE::new(*target);
        }
    }
    r
}

fn bus_flag(bus: OutputBus) -> u16 {
    match bus {
        OutputBus::Standard => 0,
        OutputBus::Gmc4 => FLAG_GMC4,
    }
}

fn instruction_points(instr: &Instruction) -> Option<&[Position]> {
    match instr {
        Instruction::Polyline { points, .. }
        | Instruction::CorrectedPolyline { points, .. } => Some(points),
        _ => None,
    }
}

/// Splits every segment longer than `max_gap` into evenly spaced pieces.
///
/// Original points are passed through untouched, so endpoints survive
/// exactly; inserted points interpolate all four components linearly.
fn subdivide(points: &[Position], max_gap: f32) -> Vec<Position> {
    let mut result = Vec::with_capacity(points.len());
    result.push(points[0]);
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let dist = a.distance(&b);
        let segments = if dist > max_gap {
            (dist / max_gap).ceil() as usize
        } else {
            1
        };
        for i in 1..segments {
            let t = i as f32 / segments as f32;
            result.push(Position {
                x: a.x + (b.x - a.x) * t,
                y: a.y + (b.y - a.y) * t,
                z: a.z + (b.z - a.z) * t,
                a: a.a + (b.a - a.a) * t,
            });
        }
        result.push(b);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input;
    use approx::assert_relative_eq;

    fn one_layer() -> Vec<MarkParameter> {
        vec![MarkParameter::default()]
    }

    fn open_builder() -> Builder {
        let mut b = Builder::new();
        b.open().unwrap();
        b.set_layers(&one_layer()).unwrap();
        b
    }

    #[test]
    fn instructions_rejected_outside_scope() {
        let mut b = Builder::new();
        let err = b.add_wait(1.0).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(b.instructions().is_empty());
    }

    #[test]
    fn nested_open_rejected() {
        let mut b = Builder::new();
        b.open().unwrap();
        assert!(matches!(b.open(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn reopen_after_close_rejected() {
        let mut b = Builder::new();
        b.open().unwrap();
        b.close().unwrap();
        assert!(matches!(b.open(), Err(Error::InvalidState(_))));
        b.reset();
        b.open().unwrap();
    }

    #[test]
    fn repeat_nesting_enforced() {
        let mut b = open_builder();
        let a = b.begin_repeat(3).unwrap();
        let inner = b.begin_repeat(2).unwrap();
        assert_eq!(a, 0);
        assert_eq!(inner, 1);

        // Closing the outer repeat before the inner one is a state error.
        assert!(matches!(b.end_repeat(a), Err(Error::InvalidState(_))));
        // Inner-first succeeds.
        b.end_repeat(inner).unwrap();
        b.end_repeat(a).unwrap();
        // Both markers are now matched; closing again fails.
        assert!(matches!(b.end_repeat(a), Err(Error::InvalidState(_))));

        assert_eq!(
            b.instructions(),
            &[
                Instruction::RepeatStart { count: 3 },
                Instruction::RepeatStart { count: 2 },
                Instruction::RepeatEnd { target: 1 },
                Instruction::RepeatEnd { target: 0 },
            ]
        );
    }

    #[test]
    fn close_with_open_repeat_rejected() {
        let mut b = open_builder();
        b.begin_repeat(2).unwrap();
        assert!(matches!(b.close(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn repeat_count_must_be_positive() {
        let mut b = open_builder();
        assert!(matches!(
            b.begin_repeat(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn geometry_requires_existing_layer() {
        let mut b = Builder::new();
        b.open().unwrap();
        b.set_layers(&[MarkParameter::default(), MarkParameter::default()])
            .unwrap();
        let pts = [
            Position::new(0.0, 0.0, 0.0, 0.0),
            Position::new(1.0, 0.0, 0.0, 0.0),
        ];
        let err = b.add_polyline(&pts, 5, false).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
        assert!(b.instructions().is_empty());
    }

    #[test]
    fn out_of_range_power_rejected_without_table_change() {
        let mut b = Builder::new();
        b.set_layers(&one_layer()).unwrap();
        let before = b.layers().to_vec();

        let bad = MarkParameter {
            laser_power_pct: 150.0,
            ..MarkParameter::default()
        };
        let err = b.set_layers(&[bad]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(b.layers(), before.as_slice());
    }

    #[test]
    fn table_cannot_shrink_below_referenced_layer() {
        let mut b = Builder::new();
        b.open().unwrap();
        b.set_layers(&[MarkParameter::default(), MarkParameter::default()])
            .unwrap();
        b.add_point(Position::default(), 1.0, 1).unwrap();
        let err = b.set_layers(&one_layer()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationConflict(_)));
        // Growing (or same-size) replacement is still fine.
        b.set_layers(&[MarkParameter::default(); 3]).unwrap();
    }

    #[test]
    fn argument_ranges_enforced() {
        let mut b = open_builder();
        assert!(matches!(b.add_wait(-1.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            b.add_input_wait(14),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            b.add_output(16, true, OutputBus::Standard),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            b.add_analog(1.5, 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            b.add_analog(0.5, -0.1),
            Err(Error::InvalidArgument(_))
        ));
        let pts = [Position::default(), Position::new(1.0, 0.0, 0.0, 0.0)];
        assert!(matches!(
            b.add_break_and_correct_polyline(&pts, 0.0, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            b.add_polyline(&pts[..1], 0, false),
            Err(Error::InvalidArgument(_))
        ));
        assert!(b.instructions().is_empty());
    }

    #[test]
    fn transform_applies_at_compile_time() {
        let mut b = open_builder();
        b.set_offset(10.0, 0.0, -1.0).unwrap();
        b.add_jump(Position::new(1.0, 2.0, 3.0, 0.0)).unwrap();
        // Later transform changes must not reach back.
        b.set_offset(0.0, 0.0, 0.0).unwrap();
        assert_eq!(
            b.instructions()[0],
            Instruction::Jump(Position::new(11.0, 2.0, 2.0, 0.0))
        );
    }

    #[test]
    fn short_segments_pass_through_subdivision() {
        let pts = [
            Position::new(0.0, 0.0, 0.0, 0.0),
            Position::new(0.5, 0.0, 0.0, 0.0),
            Position::new(1.0, 0.0, 0.0, 0.0),
        ];
        let dense = subdivide(&pts, 1.0);
        assert_eq!(dense.as_slice(), &pts);
    }

    #[test]
    fn subdivision_bounds_every_gap() {
        let pts = [
            Position::new(0.0, 0.0, 0.0, 0.0),
            Position::new(10.0, 0.0, 0.0, 0.0),
            Position::new(10.0, 7.0, 2.0, 0.0),
        ];
        let max_gap = 3.0;
        let dense = subdivide(&pts, max_gap);
        for pair in dense.windows(2) {
            assert!(pair[0].distance(&pair[1]) <= max_gap + 1e-4);
        }
        // Original vertices survive exactly.
        assert_eq!(dense.first(), Some(&pts[0]));
        assert_eq!(dense.last(), Some(&pts[2]));
        assert!(dense.contains(&pts[1]));
    }

    #[test]
    fn break_and_correct_recomputes_z() {
        let mut b = open_builder();
        b.set_correction(100.0, &[0.0, 1.0]).unwrap();
        let pts = [
            Position::new(0.0, 0.0, 0.0, 0.0),
            Position::new(8.0, 0.0, 0.0, 0.0),
        ];
        b.add_break_and_correct_polyline(&pts, 2.0, 0).unwrap();

        let stored = match &b.instructions()[0] {
            Instruction::CorrectedPolyline { points, .. } => points.clone(),
            other => panic!("unexpected instruction {:?}", other),
        };
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0].x, 0.0);
        assert_eq!(stored[4].x, 8.0);
        for p in &stored {
            // Pre-correction z was 0, so the expected height is the surface
            // evaluated at the point's x/y.
            let expected = b.correction().evaluate(p.x, p.y, 0.0);
            assert_relative_eq!(p.z, expected);
        }
    }

    #[test]
    fn identity_surface_leaves_flat_polyline_flat() {
        let mut b = open_builder();
        let pts = [
            Position::new(0.0, 0.0, 0.0, 0.0),
            Position::new(1.0, 0.0, 0.0, 0.0),
        ];
        b.add_break_and_correct_polyline(&pts, 5.0, 0).unwrap();
        match &b.instructions()[0] {
            Instruction::CorrectedPolyline { points, .. } => {
                assert_eq!(points.len(), 2);
                assert!(points.iter().all(|p| p.z == 0.0));
            }
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn serialization_requires_closed_scope() {
        let mut b = Builder::new();
        assert!(matches!(b.buffer(), Err(Error::InvalidState(_))));
        b.open().unwrap();
        assert!(matches!(b.buffer(), Err(Error::InvalidState(_))));
        b.close().unwrap();
        assert!(!b.buffer().unwrap().is_empty());
    }

    #[test]
    fn sealed_builder_rejects_mutation() {
        let mut b = open_builder();
        b.add_wait(1.0).unwrap();
        b.close().unwrap();
        b.buffer().unwrap();
        assert!(matches!(
            b.set_end_power(10.0),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(b.add_wait(1.0), Err(Error::InvalidState(_))));
        // Re-serializing a sealed program is fine and reproducible.
        let a = b.buffer().unwrap();
        let c = b.buffer().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn buffer_and_file_bytes_match() {
        let mut b = open_builder();
        b.add_jump(Position::new(1.0, 2.0, 3.0, 0.0)).unwrap();
        b.add_point(Position::default(), 10.0, 0).unwrap();
        b.close().unwrap();

        let bytes = b.buffer().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("program.udm");
        b.save_to_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn minimal_program_round_trips_counts() {
        let mut b = Builder::new();
        b.open().unwrap();
        b.set_layers(&one_layer()).unwrap();
        b.add_point(Position::new(0.0, 0.0, 0.0, 0.0), 10.0, 0)
            .unwrap();
        b.add_output(0, true, OutputBus::Standard).unwrap();
        b.close().unwrap();

        let bytes = b.buffer().unwrap();
        assert!(!bytes.is_empty());
        let parsed = input::parse_file(&bytes).unwrap();
        assert_eq!(parsed.instruction_table.len(), 2);
        assert_eq!(parsed.layer_table.len(), 1);
    }
}
