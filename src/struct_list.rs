// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! List of structs.

use core::marker::PhantomData;

use crate::Result;
use crate::private::layout::{ListBuilder, ListReader, PointerBuilder, PointerReader, StructSize};
use crate::traits::{FromPointerReader, FromStructBuilder, FromStructReader, IndexMove, ListIter};

#[derive(Clone, Copy)]
pub struct Owned<T> {
    marker: PhantomData<T>,
}

impl<T> crate::traits::Owned for Owned<T>
where
    T: crate::traits::Owned,
{
    type Reader<'a> = Reader<'a, T>;
    type Builder<'a> = Builder<'a, T>;
}

pub struct Reader<'a, T>
where
    T: crate::traits::Owned,
{
    marker: PhantomData<T>,
    reader: ListReader<'a>,
}

// Have to do this manually because derive(Copy) doesn't know about PhantomData.
impl<T: crate::traits::Owned> Copy for Reader<'_, T> {}

impl<T: crate::traits::Owned> Clone for Reader<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: crate::traits::Owned> Reader<'a, T> {
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(self) -> ListIter<Reader<'a, T>, T::Reader<'a>> {
        let l = self.len();
        ListIter::new(self, l)
    }
}

impl<'a, T> FromPointerReader<'a> for Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromStructReader<'a>,
{
    fn get_from_pointer(
        reader: &PointerReader<'a>,
        default: Option<&'a [crate::Word]>,
    ) -> Result<Reader<'a, T>> {
        Ok(Reader {
            reader: reader.get_list(crate::private::layout::ElementSize::InlineComposite, default)?,
            marker: PhantomData,
        })
    }
}

impl<'a, T> IndexMove<u32, T::Reader<'a>> for Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromStructReader<'a>,
{
    fn index_move(&self, index: u32) -> T::Reader<'a> {
        self.get(index)
    }
}

impl<'a, T> Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromStructReader<'a>,
{
    /// Gets the element at position `index`. Panics if `index` is greater
    /// than or equal to `len()`.
    pub fn get(&self, index: u32) -> T::Reader<'a> {
        assert!(index < self.len());
        <T::Reader<'a> as FromStructReader<'a>>::new(self.reader.get_struct_element(index))
    }
}

impl<'a, T> crate::traits::IntoInternalListReader<'a> for Reader<'a, T>
where
    T: crate::traits::Owned,
{
    fn into_internal_list_reader(self) -> ListReader<'a> {
        self.reader
    }
}

pub struct Builder<'a, T>
where
    T: crate::traits::Owned,
{
    marker: PhantomData<T>,
    builder: ListBuilder<'a>,
}

impl<'a, T> Builder<'a, T>
where
    T: crate::traits::Owned,
{
    /// Allocates a fresh list of `element_count` structs laid out per
    /// `element_size`, and installs it at `pointer`.
    pub fn init(pointer: PointerBuilder<'a>, element_count: u32, element_size: StructSize) -> Builder<'a, T> {
        Builder {
            builder: pointer.init_struct_list(element_count, element_size),
            marker: PhantomData,
        }
    }

    /// Re-derives a builder over a list pointer that (per generated code's
    /// bookkeeping) is already known to hold struct elements.
    pub fn get_from_pointer(
        pointer: PointerBuilder<'a>,
        default: Option<&[crate::Word]>,
    ) -> Result<Builder<'a, T>> {
        Ok(Builder {
            builder: pointer.get_list(crate::private::layout::ElementSize::InlineComposite, default)?,
            marker: PhantomData,
        })
    }

    pub fn len(&self) -> u32 {
        self.builder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_reader(self) -> Reader<'a, T> {
        Reader {
            marker: PhantomData,
            reader: self.builder.into_reader(),
        }
    }

    pub fn reborrow(&mut self) -> Builder<'_, T> {
        Builder {
            marker: PhantomData,
            builder: self.builder.reborrow(),
        }
    }
}

impl<'a, T> Builder<'a, T>
where
    T: crate::traits::Owned,
    T::Builder<'a>: FromStructBuilder<'a>,
{
    /// Gets the element at position `index`. Panics if `index` is greater
    /// than or equal to `len()`.
    pub fn get(self, index: u32) -> T::Builder<'a> {
        assert!(index < self.len());
        <T::Builder<'a> as FromStructBuilder<'a>>::new(self.builder.get_struct_element(index))
    }
}

impl<'a, T> crate::traits::SetPointerBuilder for Reader<'a, T>
where
    T: crate::traits::Owned,
{
    fn set_pointer_builder<'b>(
        mut pointer: PointerBuilder<'b>,
        value: Reader<'a, T>,
        canonicalize: bool,
    ) -> Result<()> {
        pointer.set_list(&value.reader, canonicalize)
    }
}

impl<'a, T> ::core::iter::IntoIterator for Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromStructReader<'a>,
{
    type Item = T::Reader<'a>;
    type IntoIter = ListIter<Reader<'a, T>, Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
