use crate::scan::Page;
use liblinescan::FrameFormat;
use std::io::{self, Write};

/// Writes `page` as binary PNM: P4 for lineart, P5 for gray, P6 for color.
pub fn write_page<W: Write>(out: &mut W, page: &Page) -> io::Result<()> {
    let magic = match (page.format, page.depth) {
        (FrameFormat::Gray, 1) => "P4",
        (FrameFormat::Gray, _) => "P5",
        (FrameFormat::RGB, _) => "P6",
    };

    write!(out, "{magic}\n{} {}\n", page.width, page.height)?;
    match page.depth {
        1 => out.write_all(&page.bytes),
        8 => {
            writeln!(out, "255")?;
            out.write_all(&page.bytes)
        }
        16 => {
            writeln!(out, "65535")?;
            // PNM wants big-endian samples, the scanner hands out native order.
            let samples: Vec<u8> = page
                .bytes
                .chunks_exact(2)
                .flat_map(|sample| u16::from_ne_bytes([sample[0], sample[1]]).to_be_bytes())
                .collect();
            out.write_all(&samples)
        }
        depth => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported depth {depth}"),
        )),
    }
}
