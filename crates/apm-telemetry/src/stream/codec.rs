// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire framing for the collector channel.
//!
//! ```text
//! +----------------------------+-----------+---------------------------+
//! | Length (4 bytes, BE)       | Tag (u8)  | MessagePack body          |
//! +----------------------------+-----------+---------------------------+
//! ```
//!
//! The length prefix is handled by [`LengthDelimitedCodec`]; this module owns the
//! tag byte and the body.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::errors::CodecError;
use crate::stream::message::{DataPush, Hello, HelloAck, Request, Response};

const TAG_HELLO: u8 = 1;
const TAG_HELLO_ACK: u8 = 2;
const TAG_DATA_PUSH: u8 = 3;
const TAG_REQUEST: u8 = 4;
const TAG_RESPONSE: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Hello),
    HelloAck(HelloAck),
    DataPush(DataPush),
    Request(Request),
    Response(Response),
}

impl Frame {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Hello(_) => TAG_HELLO,
            Self::HelloAck(_) => TAG_HELLO_ACK,
            Self::DataPush(_) => TAG_DATA_PUSH,
            Self::Request(_) => TAG_REQUEST,
            Self::Response(_) => TAG_RESPONSE,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64).writer();
        buf.get_mut().put_u8(self.tag());
        match self {
            Self::Hello(body) => write_body(&mut buf, body)?,
            Self::HelloAck(body) => write_body(&mut buf, body)?,
            Self::DataPush(body) => write_body(&mut buf, body)?,
            Self::Request(body) => write_body(&mut buf, body)?,
            Self::Response(body) => write_body(&mut buf, body)?,
        }
        Ok(buf.into_inner().freeze())
    }

    /// Decodes a frame body. Tags from newer peers yield [`CodecError::UnknownTag`].
    pub fn decode(frame: &[u8]) -> Result<Frame, CodecError> {
        let (&tag, body) = frame.split_first().ok_or(CodecError::Empty)?;
        match tag {
            TAG_HELLO => Ok(Self::Hello(read_body(body)?)),
            TAG_HELLO_ACK => Ok(Self::HelloAck(read_body(body)?)),
            TAG_DATA_PUSH => Ok(Self::DataPush(read_body(body)?)),
            TAG_REQUEST => Ok(Self::Request(read_body(body)?)),
            TAG_RESPONSE => Ok(Self::Response(read_body(body)?)),
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Reads only the `request_id` of a request frame whose body failed to decode.
    #[must_use]
    pub fn salvage_request_id(frame: &[u8]) -> Option<u64> {
        #[derive(Deserialize)]
        struct RequestId {
            request_id: u64,
        }

        match frame.split_first() {
            Some((&TAG_REQUEST, body)) => read_body::<RequestId>(body)
                .ok()
                .map(|id| id.request_id),
            _ => None,
        }
    }
}

fn write_body<T: Serialize>(
    buf: &mut bytes::buf::Writer<BytesMut>,
    body: &T,
) -> Result<(), CodecError> {
    rmp_serde::encode::write_named(buf, body)?;
    Ok(())
}

fn read_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Length-prefix codec shared by both ends of the channel.
#[must_use]
pub fn length_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}
