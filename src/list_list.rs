// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! List of lists.

use core::marker::PhantomData;

use crate::Result;
use crate::private::layout::{ElementSize, ListBuilder, ListReader, PointerBuilder, PointerReader};
use crate::traits::{FromPointerBuilder, FromPointerReader, IndexMove, ListIter};

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

    pub fn iter(self) -> ListIter<Reader<'a, T>, Result<T::Reader<'a>>> {
        let l = self.len();
        ListIter::new(self, l)
    }
}

impl<'a, T> FromPointerReader<'a> for Reader<'a, T>
where
    T: crate::traits::Owned,
{
    fn get_from_pointer(
        reader: &PointerReader<'a>,
        default: Option<&'a [crate::Word]>,
    ) -> Result<Reader<'a, T>> {
        Ok(Reader {
            reader: reader.get_list(ElementSize::Pointer, default)?,
            marker: PhantomData,
        })
    }
}

impl<'a, T> Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromPointerReader<'a>,
{
    /// Gets the element at position `index`. Panics if `index` is greater
    /// than or equal to `len()`.
    pub fn get(&self, index: u32) -> Result<T::Reader<'a>> {
        assert!(index < self.len());
        let inner = self.reader.get_pointer_element(index);
        <T::Reader<'a> as FromPointerReader<'a>>::get_from_pointer(&inner, None)
    }
}

impl<'a, T> IndexMove<u32, Result<T::Reader<'a>>> for Reader<'a, T>
where
    T: crate::traits::Owned,
    T::Reader<'a>: FromPointerReader<'a>,
{
    fn index_move(&self, index: u32) -> Result<T::Reader<'a>> {
        self.get(index)
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

impl<'a, T> FromPointerBuilder<'a> for Builder<'a, T>
where
    T: crate::traits::Owned,
{
    fn init_pointer(builder: PointerBuilder<'a>, size: u32) -> Builder<'a, T> {
        Builder {
            builder: builder.init_list(ElementSize::Pointer, size),
            marker: PhantomData,
        }
    }

    fn get_from_pointer(
        builder: PointerBuilder<'a>,
        default: Option<&'a [crate::Word]>,
    ) -> Result<Builder<'a, T>> {
        Ok(Builder {
            builder: builder.get_list(ElementSize::Pointer, default)?,
            marker: PhantomData,
        })
    }
}

impl<'a, T> Builder<'a, T>
where
    T: crate::traits::Owned,
    T::Builder<'a>: FromPointerBuilder<'a>,
{
    /// Initializes the sub-list at `index` as a `T` of the given size.
    /// Panics if `index` is greater than or equal to `len()`.
    pub fn init(self, index: u32, size: u32) -> T::Builder<'a> {
        assert!(index < self.len());
        let inner = self.builder.get_pointer_element(index);
        <T::Builder<'a> as FromPointerBuilder<'a>>::init_pointer(inner, size)
    }

    /// Gets the sub-list at `index`, which must already have been
    /// initialized. Panics if `index` is greater than or equal to `len()`.
    pub fn get(self, index: u32) -> Result<T::Builder<'a>> {
        assert!(index < self.len());
        let inner = self.builder.get_pointer_element(index);
        <T::Builder<'a> as FromPointerBuilder<'a>>::get_from_pointer(inner, None)
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
    T::Reader<'a>: FromPointerReader<'a>,
{
    type Item = Result<T::Reader<'a>>;
    type IntoIter = ListIter<Reader<'a, T>, Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
