use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotchError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("taper design failed: {0}")]
    TaperDesign(String),

    #[error("channel {index} failed: {source}")]
    Channel {
        index: usize,
        #[source]
        source: Box<NotchError>,
    },

    #[error("overlap-add consistency failure: {0}")]
    Consistency(String),
}

impl NotchError {
    pub(crate) fn for_channel(index: usize, source: NotchError) -> Self {
        NotchError::Channel {
            index,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, NotchError>;
