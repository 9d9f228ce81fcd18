use thiserror::Error;

use crate::sif_lib::types::DataType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed image: {0}")]
    Malformed(String),

    #[error("no object found")]
    ObjectNotFound,

    #[error("multiple objects found")]
    MultipleObjectsFound,

    #[error("invalid object ID")]
    InvalidObjectId,

    #[error("invalid group ID")]
    InvalidGroupId,

    #[error("no descriptor slot left")]
    InsufficientCapacity,

    #[error("another primary system partition is present")]
    PrimaryPartition,

    #[error("unexpected data type {got:#x}, expected one of {want:?}")]
    UnexpectedDataType { got: i32, want: Vec<DataType> },

    #[error("partition is not a system partition")]
    UnexpectedPartitionType,

    #[error("name exceeds {} bytes", crate::sif_lib::desc::DESC_NAME_LEN)]
    NameTooLarge,

    #[error("extra exceeds {} bytes", crate::sif_lib::desc::DESC_EXTRA_LEN)]
    ExtraTooLarge,

    #[error("launch script exceeds {} bytes", crate::sif_lib::desc::HDR_LAUNCH_LEN)]
    LaunchScriptTooLarge,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
