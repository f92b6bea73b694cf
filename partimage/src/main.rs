#![doc = include_str!("../README.md")]

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, Write as _},
    os::unix::process::CommandExt as _,
    path::{Path, PathBuf},
    process::{Command, ExitCode},
};

use anyhow::{bail, Context as _};
use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;
use image::{
    aligned_size, assemble, create_disk, file_size, kernel_add_partition, parse_size, plan,
    Content, ExternalPartitioner, ImageOptions, PartitionRequest, PartitionTableSink, TableKind,
    TableWriter, DEFAULT_ALIGN_BITS,
};
use log::{debug, error, info, LevelFilter};
use part::{PartitionError, PartitionKind};

#[derive(Debug, Subcommand)]
enum CliSubcommand {
    /// Creates a partitioned disk image out of content files
    Image {
        #[arg(short, long, default_value_t = DEFAULT_ALIGN_BITS, help = "Partition Alignment, in bits")]
        align: u32,

        #[arg(short, long, value_parser = parse_size, help = "First Partition Offset")]
        base: Option<u64>,

        #[arg(short, long, value_parser = parse_size, help = "Disk Size")]
        size: Option<u64>,

        #[arg(short, long, help = "Use a DOS Partition Table")]
        dos: bool,

        #[arg(
            short = 'u',
            long,
            help = "Disk GUID, or DOS Disk Identifier"
        )]
        label: Option<String>,

        #[arg(
            short,
            long,
            conflicts_with = "dos",
            help = "External Program Creating the Partition Table"
        )]
        partitioner: Option<OsString>,

        #[arg(help = "Output Disk Image")]
        disk: PathBuf,

        #[arg(
            required = true,
            num_args = 2..,
            value_names = ["CONTENT", "KIND"],
            help = "Partition Content and Kind Pairs"
        )]
        parts: Vec<String>,

        #[arg(last = true, help = "Command to run once the disk is assembled")]
        exec: Vec<OsString>,
    },

    /// Appends a partition to a GUID Partition Table, filling the disk
    GptExtend {
        #[arg(short = 'n', long, help = "Expected Partition Number")]
        part: Option<u32>,

        #[arg(help = "Disk File or Device")]
        disk: PathBuf,
    },

    /// Appends a partition to a DOS Partition Table, filling the disk
    DosExtend {
        #[arg(short = 'n', long, help = "Expected Partition Number")]
        part: Option<u32>,

        #[arg(short, long, help = "Register the new partition with the kernel")]
        kernel: bool,

        #[arg(help = "Disk File or Device")]
        disk: PathBuf,
    },

    /// Prints the aligned total size of files or devices
    Size {
        #[arg(short, long, default_value_t = 0, help = "Alignment, in bits")]
        align: u32,

        #[arg(short, long, default_value_t = 0, help = "Output Unit, in bits")]
        sectors: u32,

        #[arg(short, long, value_parser = parse_size, default_value = "0", help = "Extra Size")]
        extra: u64,

        #[arg(required = true, help = "Files or Devices")]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, Parser)]
#[command(version, about = "Partitioned Disk Image Utility")]
struct Cli {
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Verbosity")]
    verbose: u8,

    #[clap(subcommand)]
    command: CliSubcommand,
}

fn init_logger(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));

    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }

    builder.init();
}

fn partition_requests(args: &[String]) -> Result<Vec<PartitionRequest>, anyhow::Error> {
    if args.len() % 2 != 0 {
        bail!("Partitions must be given as content and kind pairs");
    }

    args.chunks_exact(2)
        .map(|pair| {
            let content = pair[0]
                .parse::<Content>()
                .with_context(|| format!("Invalid partition content {}", pair[0]))?;

            Ok(PartitionRequest::new(
                content,
                PartitionKind::from(pair[1].as_str()),
            ))
        })
        .collect()
}

fn open_disk(path: &Path) -> Result<File, anyhow::Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Couldn't open {}", path.display()))
}

fn build_image(
    disk_path: &Path,
    options: &ImageOptions,
    parts: &[String],
    partitioner: Option<OsString>,
) -> Result<(), anyhow::Error> {
    let requests = partition_requests(parts)?;
    let layout = plan(&requests, options).context("Couldn't lay the partitions out")?;

    info!(
        "Creating {} with {} partitions, {} bytes",
        disk_path.display(),
        layout.parts.len(),
        layout.disk_size
    );

    let disk = create_disk(disk_path)
        .with_context(|| format!("Couldn't create {}", disk_path.display()))?;

    let mut sink: Box<dyn PartitionTableSink> = match partitioner {
        Some(program) => Box::new(ExternalPartitioner::new(
            program,
            disk_path.to_path_buf(),
            options.label(),
        )),
        None => Box::new(TableWriter::new(options.table, options.label())),
    };

    assemble(&disk, &layout, sink.as_mut())
        .with_context(|| format!("Couldn't assemble {}", disk_path.display()))?;

    Ok(())
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    match cli.command {
        CliSubcommand::Image {
            align,
            base,
            size,
            dos,
            label,
            partitioner,
            disk,
            parts,
            exec,
        } => {
            let options = ImageOptions {
                align_bits: align,
                base,
                size,
                table: if dos { TableKind::Dos } else { TableKind::Gpt },
                label,
            };

            debug!(
                "Alignment of {align} bits, label {}",
                options.label()
            );

            build_image(&disk, &options, &parts, partitioner)?;

            if let Some((program, args)) = exec.split_first() {
                info!("Running {}", program.to_string_lossy());

                let err = Command::new(program).args(args).exec();
                return Err(err).with_context(|| {
                    format!("Couldn't execute {}", program.to_string_lossy())
                });
            }

            Ok(())
        }
        CliSubcommand::GptExtend { part, disk } => {
            let file = open_disk(&disk)?;
            let disk_size = file_size(&file)?;

            debug!("Disk {} is {disk_size} bytes", disk.display());

            let added = gpt::add_last(&file, part, disk_size)
                .with_context(|| format!("Couldn't add a partition to {}", disk.display()))?;

            info!(
                "Added partition {} at {}, {} bytes",
                added.ordinal, added.start, added.size
            );

            Ok(())
        }
        CliSubcommand::DosExtend { part, kernel, disk } => {
            let file = open_disk(&disk)?;
            let disk_size = file_size(&file)?;

            debug!("Disk {} is {disk_size} bytes", disk.display());

            let mut sector = mbr::read_sector(&file)?;
            let added = mbr::add_last(&mut sector, part, disk_size)
                .with_context(|| format!("Couldn't add a partition to {}", disk.display()))?;
            mbr::write_sector(&file, &sector)?;

            info!(
                "Added partition {} at {}, {} bytes",
                added.ordinal, added.start, added.size
            );

            if kernel {
                kernel_add_partition(&file, &added)
                    .context("Couldn't update the kernel partition table")?;
            }

            Ok(())
        }
        CliSubcommand::Size {
            align,
            sectors,
            extra,
            files,
        } => {
            let sizes = files
                .iter()
                .map(|path| {
                    let file = File::open(path)
                        .with_context(|| format!("Couldn't open {}", path.display()))?;
                    let size = file_size(&file)?;

                    debug!("{} is {size} bytes", path.display());
                    Ok(size)
                })
                .collect::<Result<Vec<_>, anyhow::Error>>()?;

            let total = aligned_size(sizes, extra, align, sectors)?;
            writeln!(io::stdout().lock(), "{total}")?;

            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logger(cli.verbose);

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");

            if let Some(PartitionError::Partitioner(code)) = err.downcast_ref::<PartitionError>() {
                return ExitCode::from(u8::try_from(*code).unwrap_or(1));
            }

            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory as _, Parser as _};
    use image::Content;
    use part::{PartitionKind, MIB};
    use test_log::test;

    use crate::{partition_requests, Cli, CliSubcommand};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_image_arguments() {
        let cli = Cli::try_parse_from([
            "partimage", "-vv", "image", "-s", "64M", "-a", "12", "disk.img", "esp.img", "U",
            "+4M", "L", "*", "L", "--", "sync", "-f",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);

        let CliSubcommand::Image {
            align,
            size,
            dos,
            parts,
            exec,
            ..
        } = cli.command
        else {
            panic!("Wrong subcommand");
        };

        assert_eq!(align, 12);
        assert_eq!(size, Some(64 * MIB));
        assert!(!dos);
        assert_eq!(exec, ["sync", "-f"]);

        let requests = partition_requests(&parts).unwrap();
        let parsed: Vec<_> = requests
            .iter()
            .map(|r| (r.content.clone(), r.kind.clone()))
            .collect();
        assert_eq!(
            parsed,
            [
                (Content::File("esp.img".into()), PartitionKind::EfiSystem),
                (Content::Empty(4 * MIB), PartitionKind::Linux),
                (Content::Wildcard, PartitionKind::Linux),
            ]
        );
    }

    #[test]
    fn test_image_odd_pairs() {
        let cli =
            Cli::try_parse_from(["partimage", "image", "disk.img", "esp.img", "U", "+4M"]).unwrap();

        let CliSubcommand::Image { parts, .. } = cli.command else {
            panic!("Wrong subcommand");
        };

        partition_requests(&parts).unwrap_err();
    }

    #[test]
    fn test_image_bad_size() {
        Cli::try_parse_from(["partimage", "image", "-s", "12Q", "disk.img", "+4M", "L"])
            .unwrap_err();
    }

    #[test]
    fn test_image_partitioner_with_dos() {
        Cli::try_parse_from([
            "partimage", "image", "-d", "-p", "sfdisk", "disk.img", "+4M", "L",
        ])
        .unwrap_err();
    }

    #[test]
    fn test_dos_extend_arguments() {
        let cli = Cli::try_parse_from(["partimage", "dos-extend", "-k", "-n", "3", "/dev/sda"])
            .unwrap();

        let CliSubcommand::DosExtend { part, kernel, disk } = cli.command else {
            panic!("Wrong subcommand");
        };

        assert_eq!(part, Some(3));
        assert!(kernel);
        assert_eq!(disk.to_str(), Some("/dev/sda"));
    }

    #[test]
    fn test_size_arguments() {
        let cli =
            Cli::try_parse_from(["partimage", "size", "-a", "20", "-e", "1M", "a.img", "b.img"])
                .unwrap();

        let CliSubcommand::Size {
            align,
            sectors,
            extra,
            files,
        } = cli.command
        else {
            panic!("Wrong subcommand");
        };

        assert_eq!(align, 20);
        assert_eq!(sectors, 0);
        assert_eq!(extra, MIB);
        assert_eq!(files.len(), 2);
    }
}
