use std::{io, path::PathBuf};

use thiserror::Error;

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid metadata entry `{0}`")]
    InvalidMetadata(String),

    #[error(
        "The piece size `{0}` cannot be divided into blocks of at most 16 KiB"
    )]
    InvalidBlockSize(u64),

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    Duplicate,

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    BencodeError(String),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderNotFound(PathBuf),

    #[error("The socket limit of {0} was reached")]
    SocketLimit(usize),

    #[error("The bit index {0} is out of range for a bitfield of {1} bits")]
    BitOutOfRange(usize, usize),

    #[error("Bitfields of {0} and {1} bits cannot be combined")]
    BitfieldLength(usize, usize),

    #[error("The file index {0} does not exist on this torrent")]
    FileIndexInvalid(usize),

    #[error(
        "The request of {length} bytes at offset {offset} of piece {piece} is \
         out of bounds"
    )]
    InvalidRequest { piece: usize, offset: u64, length: u64 },

    #[error("The tracker list is not valid")]
    TrackerListInvalid,

    #[error("The event thread is not running")]
    EventThreadClosed,

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format: {0}"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not serialize the configuration: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),
}
