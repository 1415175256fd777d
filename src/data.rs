// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! Accessors for `Data` fields -- an untyped byte list with no terminator,
//! as opposed to `Text`'s NUL-terminated variant.
//!
//! As with [crate::text], reading always copies into a fresh
//! [alloc::vec::Vec] rather than handing back a borrowed `&[u8]` view.

use alloc::vec::Vec;

use crate::private::layout::{ElementSize, ListBuilder, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, SetPointerBuilder};
use crate::{Result, Word};

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader;
    type Builder<'a> = Builder<'a>;
}

/// An owned copy of a `Data` field's content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reader {
    value: Vec<u8>,
}

impl Reader {
    pub fn as_slice(&self) -> &[u8] {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.value
    }
}

impl core::ops::Deref for Reader {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.value
    }
}

impl From<Reader> for Vec<u8> {
    fn from(r: Reader) -> Vec<u8> {
        r.value
    }
}

impl<'a> FromPointerReader<'a> for Reader {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader> {
        let list = reader.get_list(ElementSize::Byte, default)?;
        Ok(Reader {
            value: list.into_raw_bytes().to_vec(),
        })
    }
}

impl SetPointerBuilder for Reader {
    fn set_pointer_builder(pointer: PointerBuilder<'_>, value: Reader, canonicalize: bool) -> Result<()> {
        <&[u8] as SetPointerBuilder>::set_pointer_builder(pointer, &value.value, canonicalize)
    }
}

impl<'b> SetPointerBuilder for &'b [u8] {
    fn set_pointer_builder(pointer: PointerBuilder<'_>, value: &'b [u8], _canonicalize: bool) -> Result<()> {
        write(pointer, value);
        Ok(())
    }
}

pub(crate) fn write(pointer: PointerBuilder<'_>, value: &[u8]) {
    let mut builder = pointer.init_list(ElementSize::Byte, value.len() as u32);
    builder.as_raw_bytes().copy_from_slice(value);
}

/// A writable view of an allocated `Data` field.
pub struct Builder<'a> {
    builder: ListBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&mut self) -> &mut [u8] {
        self.builder.as_raw_bytes()
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn into_reader(self) -> Reader {
        Reader {
            value: self.builder.into_reader().into_raw_bytes().to_vec(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Builder<'a> {
        Builder {
            builder: builder.init_list(ElementSize::Byte, size),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Builder<'a>> {
        Ok(Builder {
            builder: builder.get_list(ElementSize::Byte, default)?,
        })
    }
}
