// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! An untyped pointer field -- `AnyPointer` in schema language. Used for
//! message roots (`message::Reader::get_root`/`Builder::get_root` go
//! through here) and for schema fields declared `AnyPointer`.

use crate::private::layout::{ElementSize, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, Owned};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned_;

impl Owned for Owned_ {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: PointerReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(reader: PointerReader<'a>) -> Reader<'a> {
        Reader { reader }
    }

    pub fn is_null(&self) -> bool {
        self.reader.is_null()
    }

    pub fn total_size(&self) -> Result<crate::MessageSize> {
        self.reader.total_size()
    }

    /// Interprets the pointer as the given struct type. Generated code is
    /// the usual caller; this crate itself only needs it for roots.
    pub fn get_as<T: FromPointerReader<'a>>(self) -> Result<T> {
        T::get_from_pointer(&self.reader, None)
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, _default: Option<&'a [crate::Word]>) -> Result<Reader<'a>> {
        Ok(Reader { reader: *reader })
    }
}

pub struct Builder<'a> {
    builder: PointerBuilder<'a>,
}

impl<'a> Builder<'a> {
    pub fn new(builder: PointerBuilder<'a>) -> Builder<'a> {
        Builder { builder }
    }

    pub fn is_null(&self) -> bool {
        self.builder.is_null()
    }

    pub fn clear(&mut self) {
        self.builder.clear();
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }

    pub fn as_reader(&self) -> Reader<'_> {
        Reader {
            reader: self.builder.as_reader(),
        }
    }

    pub fn init_as<T: FromPointerBuilder<'a>>(self) -> T {
        T::init_pointer(self.builder, 0)
    }

    pub fn init_struct_as(self, data_words: u32, pointer_words: u16) -> crate::private::layout::StructBuilder<'a> {
        self.builder.init_struct(data_words, pointer_words)
    }

    pub fn init_list_as(self, element_size: ElementSize, element_count: u32) -> crate::private::layout::ListBuilder<'a> {
        self.builder.init_list(element_size, element_count)
    }

    pub fn get_as<T: FromPointerBuilder<'a>>(self) -> Result<T> {
        T::get_from_pointer(self.builder, None)
    }

    pub fn set_as<T: crate::traits::SetPointerBuilder>(&mut self, value: T) -> Result<()> {
        T::set_pointer_builder(self.builder.reborrow(), value, false)
    }

    /// Deep-copies a struct from (possibly) another message's reader into
    /// this slot.
    pub fn set_as_struct(&mut self, value: &crate::private::layout::StructReader<'_>) -> Result<()> {
        self.builder.set_struct(value)
    }

    /// Deep-copies a list from (possibly) another message's reader into
    /// this slot.
    pub fn set_as_list(&mut self, value: &crate::private::layout::ListReader<'_>) -> Result<()> {
        self.builder.set_list(value, false)
    }

    pub fn copy_from(&mut self, other: Reader<'_>) -> Result<()> {
        self.builder.copy_from(other.reader)
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Builder<'a> {
        Builder { builder }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, _default: Option<&'a [crate::Word]>) -> Result<Builder<'a>> {
        Ok(Builder { builder })
    }
}
