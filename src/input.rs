//! Zero-copy reading of serialized marking programs.

use std::mem::size_of;

use num_traits::FromPrimitive;
use zerocopy::{FromBytes, LayoutVerified, Unaligned};

use crate::model::{Instruction, OutputBus, Position};
use crate::{
    FileHeader, InstrRecord, LayerRecord, MagicHeader, Opcode, PosRecord,
    F64LE, FLAG_3D, FLAG_GMC4, FLAG_ON, MAGIC, VERSION,
};

/// Borrows from an in-memory file image to indicate all known records in the
/// file. This is the zero-copy way of reading files.
///
/// Each field in this struct references some part of an in-memory file image
/// with lifetime `'a`.
pub struct Layout<'a> {
    /// Magic header.
    pub magic: &'a MagicHeader,
    /// File header: program-wide configuration plus section locations.
    pub header: &'a FileHeader,
    /// Correction-surface polynomial coefficients, ascending power.
    pub correction: &'a [F64LE],
    /// Layer parameter table.
    pub layer_table: &'a [LayerRecord],
    /// Instruction table, in program order.
    pub instruction_table: &'a [InstrRecord],
    /// Point arrays corresponding to records in `instruction_table`; empty
    /// for instructions that carry no geometry data.
    pub point_data: Vec<&'a [PosRecord]>,
}

impl<'a> Layout<'a> {
    /// Decodes the whole instruction table back into [`Instruction`] values.
    pub fn decode_instructions(&self) -> Result<Vec<Instruction>, ParseError> {
        self.instruction_table
            .iter()
            .zip(&self.point_data)
            .map(|(record, points)| decode_instruction(record, points))
            .collect()
    }
}

/// Errors produced by `parse_file` and `decode_instruction`. These only
/// reflect structural issues in the file; field values are not range-checked.
#[derive(Copy, Clone, Debug, thiserror::Error)]
pub enum ParseError {
    /// The file ended before the mandatory file header, or referenced a
    /// section using an offset/length past the end of the file.
    #[error("file truncated")]
    Truncated,
    /// The file's magic number was not recognized. This gets priority over
    /// other parse errors to provide better feedback if you try to parse
    /// garbage.
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    /// The file carries a format revision this library does not understand.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    /// An instruction record's opcode is not a known discriminant.
    #[error("unknown opcode 0x{0:04x}")]
    BadOpcode(u16),
}

/// Examines the structure of `buf` and parses it into a `Layout`.
///
/// This only ensures that the file is long enough to contain the records it
/// says it does; field values within the records are not validated.
pub fn parse_file(buf: &[u8]) -> Result<Layout<'_>, ParseError> {
    let magic_header = parse_type::<MagicHeader>(buf, 0)?;

    // Indicate magic errors *first*, before trying a bunch of silly parsing.
    if magic_header.magic.get() != MAGIC {
        return Err(ParseError::BadMagic(magic_header.magic.get()));
    }
    if magic_header.version.get() != VERSION {
        return Err(ParseError::UnsupportedVersion(magic_header.version.get()));
    }

    let header =
        parse_type::<FileHeader>(buf, size_of::<MagicHeader>() as u32)?;

    let correction = parse_slice::<F64LE>(
        buf,
        header.correction_offset.get(),
        header.correction_count.get(),
    )?;
    let layer_table = parse_slice::<LayerRecord>(
        buf,
        header.layer_table_offset.get(),
        header.layer_count.get(),
    )?;
    let instruction_table = parse_slice::<InstrRecord>(
        buf,
        header.instruction_table_offset.get(),
        header.instruction_count.get(),
    )?;

    let point_data: Result<Vec<_>, _> = instruction_table
        .iter()
        .map(|record| {
            parse_pos_bytes(buf, record.data_offset.get(), record.data_len.get())
        })
        .collect();
    let point_data = point_data?;

    Ok(Layout {
        magic: magic_header,
        header,
        correction,
        layer_table,
        instruction_table,
        point_data,
    })
}

/// Decodes one instruction record, with `points` being its slice of the data
/// section (empty for instructions that carry none).
pub fn decode_instruction(
    record: &InstrRecord,
    points: &[PosRecord],
) -> Result<Instruction, ParseError> {
    let opcode = Opcode::from_u16(record.opcode.get())
        .ok_or(ParseError::BadOpcode(record.opcode.get()))?;
    let flags = record.flags.get();
    let bus = if flags & FLAG_GMC4 != 0 {
        OutputBus::Gmc4
    } else {
        OutputBus::Standard
    };

    Ok(match opcode {
        Opcode::Jump => Instruction::Jump(args_position(record)),
        Opcode::Wait => Instruction::Wait(record.args[0].get()),
        Opcode::GuideLaser => Instruction::GuideLaser(flags & FLAG_ON != 0),
        Opcode::WaitInput => Instruction::WaitInput(record.word.get()),
        Opcode::SetOutputs => Instruction::SetOutputs {
            mask: record.word.get(),
            bus,
        },
        Opcode::SetOutput => Instruction::SetOutput {
            index: record.word.get(),
            level: flags & FLAG_ON != 0,
            bus,
        },
        Opcode::SetAnalog => Instruction::SetAnalog {
            a: record.args[0].get(),
            b: record.args[1].get(),
        },
        Opcode::Polyline => Instruction::Polyline {
            points: decode_points(points),
            layer: record.word.get() as usize,
            three_d: flags & FLAG_3D != 0,
        },
        Opcode::Point => Instruction::Point {
            pos: args_position(record),
            dwell_ms: record.args[4].get(),
            layer: record.word.get() as usize,
        },
        Opcode::CorrectedPolyline => Instruction::CorrectedPolyline {
            points: decode_points(points),
            max_gap: record.args[0].get(),
            layer: record.word.get() as usize,
        },
        Opcode::RepeatStart => Instruction::RepeatStart {
            count: record.word.get(),
        },
        Opcode::RepeatEnd => Instruction::RepeatEnd {
            target: record.word.get(),
        },
    })
}

fn args_position(record: &InstrRecord) -> Position {
    Position {
        x: record.args[0].get(),
        y: record.args[1].get(),
        z: record.args[2].get(),
        a: record.args[3].get(),
    }
}

fn decode_points(points: &[PosRecord]) -> Vec<Position> {
    points
        .iter()
        .map(|p| Position {
            x: p.x.get(),
            y: p.y.get(),
            z: p.z.get(),
            a: p.a.get(),
        })
        .collect()
}

fn parse_type<T: FromBytes + Unaligned>(
    buf: &[u8],
    offset: u32,
) -> Result<&T, ParseError> {
    Ok(LayoutVerified::<_, T>::new_unaligned(parse_bytes(
        buf,
        offset,
        size_of::<T>() as u32,
    )?)
    .ok_or(ParseError::Truncated)?
    .into_ref())
}

fn parse_slice<T: FromBytes + Unaligned>(
    buf: &[u8],
    offset: u32,
    len: u32,
) -> Result<&[T], ParseError> {
    Ok(LayoutVerified::<_, [T]>::new_slice_unaligned(parse_bytes(
        buf,
        offset,
        size_of::<T>() as u32 * len,
    )?)
    .ok_or(ParseError::Truncated)?
    .into_slice())
}

/// Like `parse_slice` for `PosRecord`, but sized in bytes as stored in the
/// instruction record. A byte length that is not a whole number of records
/// is treated as truncation.
fn parse_pos_bytes(
    buf: &[u8],
    offset: u32,
    len: u32,
) -> Result<&[PosRecord], ParseError> {
    Ok(
        LayoutVerified::<_, [PosRecord]>::new_slice_unaligned(parse_bytes(
            buf, offset, len,
        )?)
        .ok_or(ParseError::Truncated)?
        .into_slice(),
    )
}

fn parse_bytes(buf: &[u8], offset: u32, len: u32) -> Result<&[u8], ParseError> {
    let offset = offset as usize;
    let end = offset.wrapping_add(len as usize);
    if end < offset || end > buf.len() {
        return Err(ParseError::Truncated);
    }
    Ok(&buf[offset..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimension, MarkParameter, Protocol, TriggerEdge};
    use crate::output::Builder;
    use approx::assert_relative_eq;

    fn sample_program() -> Vec<u8> {
        let mut b = Builder::new();
        b.set_protocol(Protocol::Sl2, Dimension::ThreeD).unwrap();
        b.set_correction(160.0, &[1.0, 0.5]).unwrap();
        b.set_foot_trigger(25, TriggerEdge::Level).unwrap();
        b.set_layers(&[MarkParameter::default(), MarkParameter::default()])
            .unwrap();
        b.open().unwrap();
        b.add_guide_laser(true).unwrap();
        b.add_jump(Position::new(1.0, -2.0, 0.5, 0.0)).unwrap();
        let rep = b.begin_repeat(4).unwrap();
        b.add_polyline(
            &[
                Position::new(0.0, 0.0, 0.0, 0.0),
                Position::new(5.0, 0.0, 0.0, 0.0),
                Position::new(5.0, 5.0, 0.0, 0.0),
            ],
            1,
            false,
        )
        .unwrap();
        b.add_wait(2.5).unwrap();
        b.end_repeat(rep).unwrap();
        b.add_analog(0.25, 0.75).unwrap();
        b.add_outputs(0b1010, OutputBus::Gmc4).unwrap();
        b.add_input_wait(13).unwrap();
        b.close().unwrap();
        b.buffer().unwrap()
    }

    #[test]
    fn round_trips_header_fields() {
        let bytes = sample_program();
        let layout = parse_file(&bytes).unwrap();
        assert_eq!(layout.magic.magic.get(), MAGIC);
        assert_eq!(layout.header.protocol.get(), Protocol::Sl2 as u32);
        assert_eq!(layout.header.dimension.get(), Dimension::ThreeD as u32);
        assert_eq!(layout.header.foot_trigger_enable.get(), 1);
        assert_eq!(layout.header.foot_trigger_delay_ms.get(), 25);
        assert_eq!(
            layout.header.foot_trigger_edge.get(),
            TriggerEdge::Level as u32
        );
        assert_relative_eq!(layout.header.base_focal.get(), 160.0);
        assert_eq!(layout.correction.len(), 2);
        assert_relative_eq!(layout.correction[0].get(), 1.0);
        assert_relative_eq!(layout.correction[1].get(), 0.5);
        assert_eq!(layout.layer_table.len(), 2);
        assert_eq!(
            MarkParameter::from(&layout.layer_table[0]),
            MarkParameter::default()
        );
    }

    #[test]
    fn round_trips_instruction_stream() {
        let mut b = Builder::new();
        b.set_layers(&[MarkParameter::default()]).unwrap();
        b.open().unwrap();
        b.add_point(Position::new(3.0, 4.0, 0.0, 0.0), 12.0, 0)
            .unwrap();
        b.add_output(7, true, OutputBus::Standard).unwrap();
        b.add_break_and_correct_polyline(
            &[
                Position::new(0.0, 0.0, 0.0, 0.0),
                Position::new(4.0, 0.0, 0.0, 0.0),
            ],
            1.0,
            0,
        )
        .unwrap();
        b.close().unwrap();
        let expected = b.instructions().to_vec();
        let bytes = b.buffer().unwrap();

        let layout = parse_file(&bytes).unwrap();
        let decoded = layout.decode_instructions().unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn decodes_control_flow_and_io() {
        let bytes = sample_program();
        let layout = parse_file(&bytes).unwrap();
        let decoded = layout.decode_instructions().unwrap();
        assert_eq!(decoded.len(), 9);
        assert_eq!(decoded[0], Instruction::GuideLaser(true));
        assert_eq!(decoded[2], Instruction::RepeatStart { count: 4 });
        assert_eq!(decoded[5], Instruction::RepeatEnd { target: 2 });
        assert_eq!(
            decoded[7],
            Instruction::SetOutputs {
                mask: 0b1010,
                bus: OutputBus::Gmc4,
            }
        );
        assert_eq!(decoded[8], Instruction::WaitInput(13));
        match &decoded[3] {
            Instruction::Polyline {
                points,
                layer,
                three_d,
            } => {
                assert_eq!(points.len(), 3);
                assert_eq!(*layer, 1);
                assert!(!three_d);
            }
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_program();
        bytes[0] ^= 0xff;
        assert!(matches!(
            parse_file(&bytes),
            Err(ParseError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample_program();
        bytes[4] = 99;
        assert!(matches!(
            parse_file(&bytes),
            Err(ParseError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_truncation_anywhere() {
        let bytes = sample_program();
        for cut in [3, size_of::<MagicHeader>() + 5, bytes.len() - 1] {
            assert!(matches!(
                parse_file(&bytes[..cut]),
                Err(ParseError::Truncated)
            ));
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let record = InstrRecord {
            opcode: crate::U16LE::new(0xbeef),
            ..InstrRecord::default()
        };
        assert!(matches!(
            decode_instruction(&record, &[]),
            Err(ParseError::BadOpcode(0xbeef))
        ));
    }
}
