// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid tile format tag: {0}")]
    InvalidTileFormat(i64),

    #[error("Invalid resource kind: {0}")]
    InvalidResourceKind(String),

    #[error("Invalid tile coordinate: scale={scale} x={x} y={y}")]
    InvalidTileCoordinate { scale: i32, x: i32, y: i32 },

    #[error("Invalid scale range: {min}..={max}")]
    InvalidScaleRange { min: i32, max: i32 },
}
