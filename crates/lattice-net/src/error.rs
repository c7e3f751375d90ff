use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("connection cache already holds an entry named [{0}]")]
    Duplicate(String),
    #[error("no cache entry named [{0}]")]
    NotFound(String),
    #[error("no nodes of type [{0}]")]
    NoSuchType(String),
    #[error("all nodes of type [{0}] dead or unreachable")]
    AllDead(String),
    #[error("peer [{0}] has no live connection")]
    NotConnected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
