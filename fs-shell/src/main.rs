mod logger;

use clap::{Parser, Subcommand};
use log::info;
use sector_fs::{
    BlockDevice, FileDisk, FileSystem, OpenFlags, DEFAULT_NUM_SECTORS, SECTOR_SIZE,
};
use std::error::Error;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Bytes moved per request by `cp` and `perf`.
const TRANSFER_SIZE: usize = 10;
const PERF_FILE: &str = "TestFile";
const PERF_CONTENTS: &[u8] = b"1234567890";
const PERF_FILE_SIZE: usize = PERF_CONTENTS.len() * 5000;

#[derive(Parser)]
#[command(about = "Inspect and modify a sector-fs disk image")]
struct Args {
    /// Disk image path
    #[arg(short, long, default_value = "fs.img")]
    image: PathBuf,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh, empty file system image
    Format {
        /// Disk size in sectors
        #[arg(short, long, default_value_t = DEFAULT_NUM_SECTORS)]
        sectors: usize,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Copy a host file into the image
    Cp { src: PathBuf, dst: String },
    /// Print a file to stdout
    Cat { path: String },
    /// Remove a file or an empty directory
    Rm { path: String },
    /// Show the header of a file or directory
    Stat { path: String },
    /// Write, read back and remove a large file in small requests
    Perf,
    /// Use the pipe buffer
    Pipe {
        #[command(subcommand)]
        action: PipeAction,
    },
}

#[derive(Subcommand)]
enum PipeAction {
    /// Append text to the pipe
    Push { text: String },
    /// Print and empty the pipe
    Pop,
}

fn mount(image: &Path) -> Result<Arc<FileSystem>, Box<dyn Error>> {
    let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::open(image)?);
    Ok(FileSystem::mount(disk)?)
}

fn copy(fs: &Arc<FileSystem>, src: &Path, dst: &str) -> Result<(), Box<dyn Error>> {
    let mut host = File::open(src)?;
    let len = host.metadata()?.len() as usize;
    info!("copying {} bytes from {:?} to {}", len, src, dst);
    fs.create(dst, 0)?;
    let file = fs.open_with(dst, OpenFlags::WRITE_ONLY)?;
    let mut buffer = [0u8; TRANSFER_SIZE];
    loop {
        let read = host.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write(&buffer[..read])?;
    }
    Ok(())
}

fn perf(fs: &Arc<FileSystem>) -> Result<(), Box<dyn Error>> {
    println!(
        "Sequential write of {} byte file, in {} byte chunks",
        PERF_FILE_SIZE, TRANSFER_SIZE
    );
    let start = Instant::now();
    fs.create(PERF_FILE, 0)?;
    {
        let file = fs.open_with(PERF_FILE, OpenFlags::WRITE_ONLY)?;
        for _ in 0..PERF_FILE_SIZE / PERF_CONTENTS.len() {
            let written = file.write(PERF_CONTENTS)?;
            if written < PERF_CONTENTS.len() {
                return Err("perf test: unable to write".into());
            }
        }
    }

    println!(
        "Sequential read of {} byte file, in {} byte chunks",
        PERF_FILE_SIZE, TRANSFER_SIZE
    );
    {
        let file = fs.open_with(PERF_FILE, OpenFlags::READ_ONLY)?;
        let mut buffer = [0u8; PERF_CONTENTS.len()];
        for _ in 0..PERF_FILE_SIZE / PERF_CONTENTS.len() {
            let read = file.read(&mut buffer)?;
            if read < PERF_CONTENTS.len() || buffer != PERF_CONTENTS {
                return Err("perf test: unable to read".into());
            }
        }
    }
    fs.remove(PERF_FILE)?;

    let stats = fs.disk().stats();
    println!("Elapsed: {:?}", start.elapsed());
    println!(
        "Disk I/O: reads {}, writes {}; cache hits {}, misses {}",
        stats.reads, stats.writes, stats.hits, stats.misses
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logger::init_logger(args.verbose);

    match args.command {
        Command::Format { sectors } => {
            let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::create(&args.image, sectors)?);
            let fs = FileSystem::format(disk)?;
            println!(
                "Formatted {:?}: {} sectors of {} bytes, {} free",
                args.image,
                sectors,
                SECTOR_SIZE,
                fs.free_sectors()?
            );
        }
        Command::Ls { path } => {
            let fs = mount(&args.image)?;
            for (name, is_dir) in fs.list(&path)? {
                if is_dir {
                    println!("{}/", name);
                } else {
                    println!("{}", name);
                }
            }
        }
        Command::Mkdir { path } => mount(&args.image)?.mkdir(&path)?,
        Command::Cp { src, dst } => copy(&mount(&args.image)?, &src, &dst)?,
        Command::Cat { path } => {
            let fs = mount(&args.image)?;
            let data = fs.open_with(&path, OpenFlags::READ_ONLY)?.read_all()?;
            io::stdout().write_all(&data)?;
        }
        Command::Rm { path } => mount(&args.image)?.remove(&path)?,
        Command::Stat { path } => {
            let stat = mount(&args.image)?.stat(&path)?;
            println!("{}", path);
            println!("  header sector: {}", stat.sector);
            println!("  kind:          {}", if stat.is_dir { "directory" } else { "file" });
            println!("  type:          {}", stat.file_type);
            println!("  size:          {} bytes in {} sectors", stat.size, stat.sectors);
            println!("  data sectors:  {:?}", stat.data_sectors);
            println!("  index blocks:  {:?}", stat.index_sectors);
            println!("  created:       {}", stat.created);
            println!("  accessed:      {}", stat.accessed);
            println!("  modified:      {}", stat.modified);
        }
        Command::Perf => perf(&mount(&args.image)?)?,
        Command::Pipe { action } => {
            let fs = mount(&args.image)?;
            match action {
                PipeAction::Push { text } => fs.pipe_push(text.as_bytes())?,
                PipeAction::Pop => io::stdout().write_all(&fs.pipe_pop()?)?,
            }
        }
    }
    Ok(())
}
