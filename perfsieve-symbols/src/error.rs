use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Could not open object file {0}: {1}")]
    OpenFile(PathBuf, #[source] std::io::Error),

    #[error("Could not parse the object file: {0}")]
    ObjectParse(#[source] object::read::Error),
}
