use crate::io::BinaryStreamable;
use bstr::BString as ByteString;
use core::num::NonZeroU8;
use std::io::{self, Read, Write};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("postfix null terminator was missing from a string")]
    MissingNullTerminator,

    #[error("a string is too large to be written without data loss")]
    StringTooLarge,
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        Self::new(io::ErrorKind::InvalidData, value)
    }
}

/// A length-prefixed string: `u8` length, then that many bytes, no terminator.
pub(crate) struct BString;

impl BinaryStreamable for BString {
    type Item = ByteString;

    fn from_be_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_le_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_ne_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let len = u8::from_ne_stream(stream)?;
        let mut result = vec![0u8; len.into()];
        stream.read_exact(&mut result)?;
        Ok(ByteString::new(result))
    }

    fn to_be_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_le_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_ne_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        let len: u8 = item.len().try_into().map_err(|_| Error::StringTooLarge)?;
        stream.write_all(&[len])?;
        stream.write_all(item)?;
        Ok(())
    }
}

/// A null-terminated string: bytes, then a single `\0`.
pub(crate) struct ZString;

impl BinaryStreamable for ZString {
    type Item = ByteString;

    fn from_be_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_le_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_ne_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let mut result = Vec::<u8>::new();
        loop {
            let byte = u8::from_ne_stream(stream)?;
            match byte {
                0 => break,
                byte => result.push(byte),
            };
        }

        Ok(ByteString::new(result))
    }

    fn to_be_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_le_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_ne_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        stream.write_all(item)?;
        stream.write_all(b"\0")?;
        Ok(())
    }
}

/// A length-prefixed, null-terminated string: `u8` length counting the
/// terminator, then the bytes, then `\0`.
pub(crate) struct BZString;

impl BinaryStreamable for BZString {
    type Item = ByteString;

    fn from_be_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_le_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        Self::from_ne_stream(stream)
    }

    fn from_ne_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let len = u8::from_ne_stream(stream)?;
        let Some(len) = NonZeroU8::new(len) else {
            return Err(Error::MissingNullTerminator.into());
        };

        let mut result = vec![0u8; (len.get() - 1).into()];
        stream.read_exact(&mut result)?;
        match u8::from_ne_stream(stream)? {
            b'\0' => Ok(ByteString::new(result)),
            _ => Err(Error::MissingNullTerminator.into()),
        }
    }

    fn to_be_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_le_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        Self::to_ne_stream(stream, item)
    }

    fn to_ne_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        let len: u8 = (item.len() + 1)
            .try_into()
            .map_err(|_| Error::StringTooLarge)?;
        stream.write_all(&[len])?;
        stream.write_all(item)?;
        stream.write_all(b"\0")?;
        Ok(())
    }
}

/// A wide length-prefixed string: `u16` length, then that many bytes.
pub(crate) struct WString;

impl BinaryStreamable for WString {
    type Item = ByteString;

    fn from_be_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let len = u16::from_be_stream(stream)?;
        let mut result = vec![0u8; len.into()];
        stream.read_exact(&mut result)?;
        Ok(ByteString::new(result))
    }

    fn from_le_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let len = u16::from_le_stream(stream)?;
        let mut result = vec![0u8; len.into()];
        stream.read_exact(&mut result)?;
        Ok(ByteString::new(result))
    }

    fn from_ne_stream<R: Read>(stream: &mut R) -> io::Result<Self::Item> {
        let len = u16::from_ne_stream(stream)?;
        let mut result = vec![0u8; len.into()];
        stream.read_exact(&mut result)?;
        Ok(ByteString::new(result))
    }

    fn to_be_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        let len: u16 = item.len().try_into().map_err(|_| Error::StringTooLarge)?;
        u16::to_be_stream(stream, &len)?;
        stream.write_all(item)?;
        Ok(())
    }

    fn to_le_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        let len: u16 = item.len().try_into().map_err(|_| Error::StringTooLarge)?;
        u16::to_le_stream(stream, &len)?;
        stream.write_all(item)?;
        Ok(())
    }

    fn to_ne_stream<W: Write>(stream: &mut W, item: &Self::Item) -> io::Result<()> {
        let len: u16 = item.len().try_into().map_err(|_| Error::StringTooLarge)?;
        u16::to_ne_stream(stream, &len)?;
        stream.write_all(item)?;
        Ok(())
    }
}
