use std::error::Error;

use structopt::StructOpt;

/// Prints the header, layer table, and instruction listing of a marking
/// program file.
#[derive(StructOpt, Debug)]
#[structopt(name = "udm-inspect", max_term_width = 80)]
struct Args {
    /// File to read.
    #[structopt(parse(from_os_str))]
    input: std::path::PathBuf,

    /// Also dump every point of polyline geometry.
    #[structopt(long)]
    points: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::from_args();

    let image = std::fs::read(args.input)?;
    let parsed = udm::input::parse_file(&image)?;

    println!("--- file header ---");
    println!("{:#?}", parsed.header);

    println!("--- correction surface ---");
    println!("base focal: {}", parsed.header.base_focal.get());
    for (i, k) in parsed.correction.iter().enumerate() {
        println!("k[{}] = {}", i, k.get());
    }

    println!("--- layer table ---");
    for (i, layer) in parsed.layer_table.iter().enumerate() {
        println!("{}: {:#?}", i, layer);
    }

    println!("--- instructions ---");
    for (i, instr) in parsed.decode_instructions()?.iter().enumerate() {
        match instr {
            udm::model::Instruction::Polyline { points, layer, three_d }
                if !args.points =>
            {
                println!(
                    "{:4}: Polyline {{ {} points, layer: {}, three_d: {} }}",
                    i,
                    points.len(),
                    layer,
                    three_d
                );
            }
            udm::model::Instruction::CorrectedPolyline {
                points,
                max_gap,
                layer,
            } if !args.points => {
                println!(
                    "{:4}: CorrectedPolyline {{ {} points, max_gap: {}, layer: {} }}",
                    i,
                    points.len(),
                    max_gap,
                    layer
                );
            }
            other => println!("{:4}: {:?}", i, other),
        }
    }

    Ok(())
}
