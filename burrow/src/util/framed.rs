// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Length-prefixed message framing for tunnel RPC streams.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes of
//! protobuf-encoded payload. Readers enforce a maximum length before
//! allocating; writers refuse to produce frames above their limit without
//! touching the stream.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

impl ReadError {
  /// True when the failure is a bare end-of-stream at a frame boundary,
  /// which callers treat as a clean disconnect rather than corruption.
  pub fn is_clean_eof(&self) -> bool {
    matches!(
      self,
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      } if error.kind() == std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  /// Since the frame would exceed what the receiver accepts, we return
  /// before risking corruption of the stream, skipping any write actions.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum MessageReadError {
  #[error("Failure reading message frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure decoding message from frame: {0}")]
  Decode(#[from] ::prost::DecodeError),
}

impl MessageReadError {
  pub fn is_clean_eof(&self) -> bool {
    matches!(self, MessageReadError::Read(read) if read.is_clean_eof())
  }
}

pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
  max_length: Option<usize>,
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  if let Some(max_length) = max_length {
    if buffer.len() > max_length {
      return Err(WriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len(),
      });
    }
  }
  s.write_u32(buffer.len() as u32).await?;
  s.write_all(buffer).await?;
  s.flush().await?;
  Ok(())
}

pub async fn read_framed_message<
  TStream: tokio::io::AsyncRead + Unpin,
  TOutput: prost::Message + Default,
>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, MessageReadError> {
  let buffer = read_frame(s, max_length).await?;
  let message = TOutput::decode(buffer.as_slice())?;
  Ok(message)
}

pub async fn write_framed_message<
  TStream: tokio::io::AsyncWrite + Unpin,
  TInput: prost::Message,
>(
  s: TStream,
  value: &TInput,
  max_length: Option<usize>,
) -> Result<(), WriteError> {
  let buffer = value.encode_to_vec();
  write_frame(s, &buffer, max_length).await
}
