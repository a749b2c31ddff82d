use clap::{Parser, Subcommand};
use log::{info, warn};
use minix_fs_core::{
    mkfs, BufferCache, DeviceId, FileDisk, FileSystem, FsError, Inode, InodeNo, Result, S_IFREG,
};

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// device number the image is registered under
const IMAGE_DEV: DeviceId = 1;

#[derive(Parser)]
#[command(version, about = "Minix v1 image tool")]
struct Cli {
    /// buffer cache size
    #[arg(long, default_value_t = 1024)]
    cache_kib: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format an image
    Mkfs {
        image: PathBuf,
        #[arg(long, default_value_t = 1024)]
        inodes: u16,
        #[arg(long, default_value_t = 4096)]
        blocks: u16,
    },
    /// Print the superblock and free counts
    Stat { image: PathBuf },
    /// Store a host file (stdin for `-`) in an inode, a new one unless given
    Put {
        image: PathBuf,
        file: PathBuf,
        #[arg(long)]
        inode: Option<InodeNo>,
    },
    /// Print the data of an inode
    Cat { image: PathBuf, inode: InodeNo },
}

fn open(image: &Path, cache_kib: usize) -> Result<FileSystem> {
    let cache = BufferCache::with_memory(cache_kib * 1024);
    cache.register_device(IMAGE_DEV, Arc::new(FileDisk::open(image)?));
    FileSystem::open(cache, IMAGE_DEV)
}

fn read_input(file: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    if file.as_os_str() == "-" {
        io::stdin().read_to_end(&mut data)?;
    } else {
        data = std::fs::read(file)?;
    }
    Ok(data)
}

fn put(fs: &FileSystem, file: &Path, inode: Option<InodeNo>) -> Result<InodeNo> {
    let data = read_input(file)?;
    let mut inode = match inode {
        Some(num) => {
            if !fs.is_inode_allocated(num) {
                return Err(FsError::Corrupt(format!("inode {} is not in use", num)));
            }
            let mut inode = fs.read_inode(num)?;
            fs.release_all(&mut inode)?;
            inode
        }
        None => {
            let num = fs.allocate_inode().ok_or(FsError::NoSpace(IMAGE_DEV))?;
            Inode::new(IMAGE_DEV, num, S_IFREG | 0o644)
        }
    };
    let written = fs.write_at(&mut inode, 0, &data)?;
    fs.write_inode(&mut inode)?;
    if written < data.len() {
        return Err(FsError::NoSpace(IMAGE_DEV));
    }
    info!("stored {} bytes in inode {}", written, inode.num);
    Ok(inode.num)
}

fn cat(fs: &FileSystem, num: InodeNo) -> Result<()> {
    let mut inode = fs.read_inode(num)?;
    let mut buf = vec![0u8; 16 * 1024];
    let mut pos = 0;
    let mut out = io::stdout().lock();
    loop {
        let n = fs.read_at(&mut inode, pos, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        pos += n;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Mkfs {
            image,
            inodes,
            blocks,
        } => {
            let disk = FileDisk::create(&image, blocks as usize)?;
            let sb = mkfs(&disk, inodes, blocks)?;
            println!(
                "{}: {} inodes, {} blocks, first data zone {}",
                image.display(),
                sb.ninodes,
                sb.nzones,
                sb.firstdatazone
            );
        }
        Command::Stat { image } => {
            let fs = open(&image, cli.cache_kib)?;
            let sb = fs.super_blk();
            println!("magic          {:#x}", sb.magic);
            println!("inodes         {}", sb.ninodes);
            println!("zones          {}", sb.nzones);
            println!("imap blocks    {}", sb.imap_blocks);
            println!("zmap blocks    {}", sb.zmap_blocks);
            println!("first zone     {}", sb.firstdatazone);
            println!("max size       {}", sb.max_size);
            println!("free inodes    {}", fs.free_inodes());
            println!("free zones     {}", fs.free_blocks());
            fs.close();
        }
        Command::Put { image, file, inode } => {
            let fs = open(&image, cli.cache_kib)?;
            let result = put(&fs, &file, inode);
            let stats = fs.close();
            if stats.failed > 0 {
                warn!("{} blocks could not be written back", stats.failed);
            }
            println!("{}", result?);
        }
        Command::Cat { image, inode } => {
            let fs = open(&image, cli.cache_kib)?;
            let result = cat(&fs, inode);
            fs.close();
            result?;
        }
    }
    Ok(())
}
