#![allow(dead_code)]

use bamcode::format::{BamObjectCode, MAGIC_BYTES};
use bamcode::{BamHeader, Datagram};

/// Routes engine diagnostics to the test output; `RUST_LOG=bamcode=trace`
/// shows every record.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bamcode=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Assembles a BAM stream by hand, one record at a time.
pub struct StreamBuilder {
    bytes: Vec<u8>,
    header: BamHeader,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::with_header(BamHeader::default())
    }

    pub fn with_header(header: BamHeader) -> Self {
        let mut builder = Self {
            bytes: MAGIC_BYTES.to_vec(),
            header,
        };
        builder.frame(&header.to_datagram());
        builder
    }

    pub fn record(&self, code: BamObjectCode) -> Datagram {
        let mut dg = Datagram::new(self.header.endian, self.header.stdfloat_double);
        dg.add_u8(code.as_u8());
        dg
    }

    pub fn frame(&mut self, dg: &Datagram) -> &mut Self {
        self.bytes
            .extend_from_slice(&(dg.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(dg.as_bytes());
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        let dg = self.record(BamObjectCode::Pop);
        self.frame(&dg)
    }

    pub fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// How a hand-written type definition names its parent.
pub enum Parent {
    /// No parents at all.
    None,
    /// The root type, defined inline on its first occurrence.
    Root { index: u16, first: bool },
}

/// Writes a first-occurrence type definition.
pub fn define_type(dg: &mut Datagram, index: u16, name: &str, parent: Parent) {
    dg.add_u16(index);
    dg.add_string(name).expect("short name");
    match parent {
        Parent::None => dg.add_u8(0),
        Parent::Root { index, first } => {
            dg.add_u8(1);
            dg.add_u16(index);
            if first {
                dg.add_string("TypedWritable").expect("short name");
                dg.add_u8(0);
            }
        }
    }
}
