use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("duplicate handler for command {0:#010X}")]
    DuplicateCommand(u32),
    #[error("command {0:#010X} is reserved for the framework")]
    ReservedCommand(u32),
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Proto(#[from] lattice_proto::ProtoError),
    #[error(transparent)]
    Net(#[from] lattice_net::NetError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
