use super::*;

#[derive(Debug, onlyerror::Error)]
pub enum FsError {
    #[error("I/O error on device {dev} block {block}")]
    Io { dev: DeviceId, block: BlockNo },
    #[error("no space left on device {0}")]
    NoSpace(DeviceId),
    #[error("trying to free block ({dev}:{block}), count={count}")]
    BlockBusy {
        dev: DeviceId,
        block: BlockNo,
        count: u32,
    },
    #[error("bad superblock on device {0}")]
    BadSuperBlock(DeviceId),
    #[error("no such device {0}")]
    NoDevice(DeviceId),
    #[error("bad file system geometry: {0}")]
    Geometry(String),
    #[error("file too big")]
    FileTooBig,
    #[error("corrupt on-disk record: {0}")]
    Corrupt(String),
    #[error("host I/O error: {0}")]
    HostIo(std::io::Error),
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::HostIo(err)
    }
}

impl From<bincode::Error> for FsError {
    fn from(err: bincode::Error) -> Self {
        FsError::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
