use core::fmt;
use std::{
    ffi::OsString,
    fs::File,
    io::{self, Write},
    os::unix::process::ExitStatusExt as _,
    path::PathBuf,
    process::{Child, Command, Stdio},
};

use log::{debug, info, warn};
use part::{PartitionError, PartitionList};

use crate::{parse_dos_label, ImageLayout, TableKind};

const KIB: u64 = 1 << 10;

/// Something that can lay a partition table out on a disk
pub trait PartitionTableSink {
    /// Writes the partition table describing `layout` to `disk`
    ///
    /// # Errors
    ///
    /// Returns a [`PartitionError`] if the table can't be created
    fn write_table(&mut self, disk: &File, layout: &ImageLayout) -> Result<(), PartitionError>;
}

/// Writes the partition table with our own MBR and GPT codecs
#[derive(Debug)]
pub struct TableWriter {
    table: TableKind,
    label: String,
}

impl TableWriter {
    /// Creates a new writer for a table of the given kind. The label is the
    /// disk GUID for GPT, and the disk identifier for DOS.
    #[must_use]
    pub fn new(table: TableKind, label: &str) -> Self {
        Self {
            table,
            label: label.to_owned(),
        }
    }
}

impl PartitionTableSink for TableWriter {
    fn write_table(&mut self, disk: &File, layout: &ImageLayout) -> Result<(), PartitionError> {
        match self.table {
            TableKind::Dos => {
                let sig = parse_dos_label(&self.label)?;

                let mut sector = [0_u8; mbr::MBR_SIZE];
                mbr::set_disk_signature(&mut sector, sig);
                mbr::write_parts(&mut sector, &layout.parts)?;
                mbr::write_sector(disk, &sector)
            }
            TableKind::Gpt => gpt::write_parts(disk, &layout.parts, &self.label, layout.disk_size),
        }
    }
}

/// The line-oriented description of a GPT layout, as fed to an external
/// partitioner
#[derive(Debug)]
pub struct PartitionScript<'a> {
    label: &'a str,
    parts: &'a PartitionList,
}

impl<'a> PartitionScript<'a> {
    /// Creates a new script for a GPT with the given disk GUID
    #[must_use]
    pub fn new(label: &'a str, parts: &'a PartitionList) -> Self {
        Self { label, parts }
    }
}

impl fmt::Display for PartitionScript<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "label: gpt")?;
        writeln!(f, "label-id: {}", self.label)?;

        for part in self.parts.listed() {
            writeln!(
                f,
                "{}KiB {}KiB {} -",
                part.start / KIB,
                part.size / KIB,
                part.kind
            )?;
        }

        Ok(())
    }
}

/// Hands the partition table over to an external program, such as `sfdisk`.
///
/// The program is run with the disk path as its only argument, and is fed a
/// [`PartitionScript`] on its standard input.
#[derive(Debug)]
pub struct ExternalPartitioner {
    program: OsString,
    disk: PathBuf,
    label: String,
}

impl ExternalPartitioner {
    /// Creates a new external partitioner
    #[must_use]
    pub fn new(program: OsString, disk: PathBuf, label: &str) -> Self {
        Self {
            program,
            disk,
            label: label.to_owned(),
        }
    }
}

// A partitioner closing its input early isn't an error, its exit status is
fn write_script<W: Write>(input: &mut W, script: &[u8]) -> io::Result<()> {
    match input.write_all(script) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Partitioner closed its input early");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn abandon(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!("Couldn't kill the partitioner: {err}");
    }

    if let Err(err) = child.wait() {
        warn!("Couldn't reap the partitioner: {err}");
    }
}

impl PartitionTableSink for ExternalPartitioner {
    fn write_table(&mut self, _disk: &File, layout: &ImageLayout) -> Result<(), PartitionError> {
        let script = PartitionScript::new(&self.label, &layout.parts).to_string();

        info!(
            "Running {} {}",
            self.program.to_string_lossy(),
            self.disk.display()
        );
        debug!("Partitioner script:\n{script}");

        let mut child = Command::new(&self.program)
            .arg(&self.disk)
            .stdin(Stdio::piped())
            .spawn()?;

        let fed = child
            .stdin
            .take()
            .map_or(Ok(()), |mut stdin| write_script(&mut stdin, script.as_bytes()));

        if let Err(err) = fed {
            abandon(&mut child);
            return Err(err.into());
        }

        let status = child.wait()?;
        if !status.success() {
            let code = status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(1);

            return Err(PartitionError::Partitioner(code));
        }

        Ok(())
    }
}
