// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! Accessors for `Text` fields -- a byte list with a trailing NUL that is
//! not counted in its length.
//!
//! Unlike a zero-copy `&str` view, reading a text field here always copies
//! into a fresh, UTF-8-validated [alloc::string::String]: list storage is
//! not guaranteed to stay reachable once the message is mutated further,
//! and a borrowed view would tie the result's lifetime to the whole arena
//! for no benefit most callers want.

use alloc::borrow::ToOwned;
use alloc::string::String;

use crate::private::layout::{ElementSize, ListBuilder, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{Error, Result, Word};

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader;
    type Builder<'a> = Builder<'a>;
}

/// An owned, already-validated copy of a `Text` field's content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reader {
    value: String,
}

impl Reader {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl core::ops::Deref for Reader {
    type Target = str;
    fn deref(&self) -> &str {
        &self.value
    }
}

impl core::fmt::Display for Reader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.value.fmt(f)
    }
}

impl From<Reader> for String {
    fn from(r: Reader) -> String {
        r.value
    }
}

/// Splits off the trailing NUL and validates the rest as UTF-8.
pub(crate) fn decode(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let (&last, body) = bytes
        .split_last()
        .expect("checked non-empty above");
    if last != 0 {
        return Err(Error::failed("text is not NUL-terminated".to_owned()));
    }
    let s = core::str::from_utf8(body).map_err(|_| Error::failed("text is not valid UTF-8".to_owned()))?;
    Ok(s.to_owned())
}

impl<'a> FromPointerReader<'a> for Reader {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader> {
        let list = reader.get_list(ElementSize::Byte, default)?;
        Ok(Reader {
            value: decode(list.into_raw_bytes())?,
        })
    }
}

impl SetPointerBuilder for Reader {
    fn set_pointer_builder(pointer: PointerBuilder<'_>, value: Reader, canonicalize: bool) -> Result<()> {
        <&str as SetPointerBuilder>::set_pointer_builder(pointer, &value.value, canonicalize)
    }
}

impl<'b> SetPointerBuilder for &'b str {
    fn set_pointer_builder(pointer: PointerBuilder<'_>, value: &'b str, _canonicalize: bool) -> Result<()> {
        write(pointer, value);
        Ok(())
    }
}

pub(crate) fn write(pointer: PointerBuilder<'_>, value: &str) {
    let bytes = value.as_bytes();
    let mut builder = pointer.init_list(ElementSize::Byte, bytes.len() as u32 + 1);
    let raw = builder.as_raw_bytes();
    raw[..bytes.len()].copy_from_slice(bytes);
    raw[bytes.len()] = 0;
}

/// A writable view of an allocated `Text` field. Holds a raw byte list
/// builder rather than `&mut str`, since the all-zero bytes an `init_text`
/// allocation starts with are themselves valid (if uninteresting) UTF-8.
pub struct Builder<'a> {
    builder: ListBuilder<'a>,
}

impl<'a> Builder<'a> {
    /// The length of the text, excluding the trailing NUL.
    pub fn len(&self) -> u32 {
        self.builder.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&mut self) -> &str {
        let n = self.len() as usize;
        let bytes = &self.builder.as_raw_bytes()[..n];
        core::str::from_utf8(bytes).expect("text builder content is not valid UTF-8")
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn into_reader(self) -> Reader {
        let bytes = self.builder.into_reader().into_raw_bytes();
        Reader {
            value: decode(bytes).unwrap_or_default(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Builder<'a> {
        Builder {
            builder: builder.init_list(ElementSize::Byte, size + 1),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Builder<'a>> {
        Ok(Builder {
            builder: builder.get_list(ElementSize::Byte, default)?,
        })
    }
}
