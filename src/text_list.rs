// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! `List(Text)` -- a pointer list whose elements each point at a
//! NUL-terminated byte list.

use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, IndexMove, ListIter};
use crate::Result;

#[derive(Clone, Copy)]
pub struct Owned;

impl crate::traits::Owned for Owned {
    type Reader<'a> = Reader<'a>;
    type Builder<'a> = Builder<'a>;
}

#[derive(Clone, Copy)]
pub struct Reader<'a> {
    reader: ListReader<'a>,
}

impl<'a> Reader<'a> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the element at position `index`. Panics if `index` is greater
    /// than or equal to `len()`.
    pub fn get(&self, index: u32) -> Result<crate::text::Reader> {
        assert!(index < self.len());
        let inner = self.reader.get_pointer_element(index);
        crate::text::Reader::get_from_pointer(&inner, None)
    }

    pub fn iter(self) -> ListIter<Reader<'a>, Result<crate::text::Reader>> {
        let l = self.len();
        ListIter::new(self, l)
    }
}

impl<'a> FromPointerReader<'a> for Reader<'a> {
    fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [crate::Word]>) -> Result<Reader<'a>> {
        Ok(Reader {
            reader: reader.get_list(ElementSize::Pointer, default)?,
        })
    }
}

impl<'a> IndexMove<u32, Result<crate::text::Reader>> for Reader<'a> {
    fn index_move(&self, index: u32) -> Result<crate::text::Reader> {
        self.get(index)
    }
}

impl<'a> crate::traits::IntoInternalListReader<'a> for Reader<'a> {
    fn into_internal_list_reader(self) -> ListReader<'a> {
        self.reader
    }
}

impl<'a> ::core::iter::IntoIterator for Reader<'a> {
    type Item = Result<crate::text::Reader>;
    type IntoIter = ListIter<Reader<'a>, Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

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

    /// Allocates a fresh byte list sized to `value`, blits its bytes plus
    /// the NUL terminator, and installs the list pointer in slot `index`.
    /// Panics if `index` is greater than or equal to `len()`.
    pub fn set(&mut self, index: u32, value: &str) {
        assert!(index < self.len());
        let inner = self.builder.reborrow().get_pointer_element(index);
        crate::text::write(inner, value);
    }

    /// Gets the element at position `index`, which must already have been
    /// set. Panics if `index` is greater than or equal to `len()`.
    pub fn get(&mut self, index: u32) -> Result<crate::text::Reader> {
        assert!(index < self.len());
        let inner = self.builder.reborrow().get_pointer_element(index);
        crate::text::Reader::get_from_pointer(&inner.as_reader(), None)
    }

    pub fn into_reader(self) -> Reader<'a> {
        Reader {
            reader: self.builder.into_reader(),
        }
    }

    pub fn reborrow(&mut self) -> Builder<'_> {
        Builder {
            builder: self.builder.reborrow(),
        }
    }
}

impl<'a> FromPointerBuilder<'a> for Builder<'a> {
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Builder<'a> {
        Builder {
            builder: builder.init_list(ElementSize::Pointer, size),
        }
    }

    fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [crate::Word]>) -> Result<Builder<'a>> {
        Ok(Builder {
            builder: builder.get_list(ElementSize::Pointer, default)?,
        })
    }
}

impl<'a> crate::traits::SetPointerBuilder for Reader<'a> {
    fn set_pointer_builder(mut pointer: PointerBuilder<'_>, value: Reader<'a>, canonicalize: bool) -> Result<()> {
        pointer.set_list(&value.reader, canonicalize)
    }
}
