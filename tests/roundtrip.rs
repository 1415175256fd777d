// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! End-to-end tests exercising the pieces generated code would normally
//! glue together: struct field accessors, text, far pointers, composite
//! lists, and the wire codecs. Since this crate has no schema compiler,
//! the tiny `point`/`greeting`/`container` modules below stand in for
//! `capnpc`-generated struct wrappers, built directly on
//! `capnp::private::layout` the way generated code would be.

use capnp::message::{self, HeapAllocator, ReaderOptions};
use capnp::private::layout::{PointerBuilder, PointerReader, StructBuilder, StructReader, StructSize};
use capnp::traits::{FromPointerBuilder, FromPointerReader, FromStructBuilder, FromStructReader, Owned as OwnedTrait, SetPointerBuilder};
use capnp::{any_pointer, struct_list, Result, Word};

mod point {
    use super::*;

    pub const SIZE: StructSize = StructSize { data: 1, pointers: 0 };

    #[derive(Clone, Copy)]
    pub struct Owned;

    impl OwnedTrait for Owned {
        type Reader<'a> = Reader<'a>;
        type Builder<'a> = Builder<'a>;
    }

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_x(&self) -> i32 {
            self.reader.get_data_field::<i32>(0)
        }

        pub fn get_y(&self) -> i32 {
            self.reader.get_data_field::<i32>(1)
        }
    }

    impl<'a> FromStructReader<'a> for Reader<'a> {
        fn new(reader: StructReader<'a>) -> Self {
            Reader { reader }
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader<'a>> {
            Ok(Reader::new(reader.get_struct(default)?))
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_x(&mut self, value: i32) {
            self.builder.set_data_field::<i32>(0, value);
        }

        pub fn set_y(&mut self, value: i32) {
            self.builder.set_data_field::<i32>(1, value);
        }

        pub fn into_reader(self) -> Reader<'a> {
            Reader::new(self.builder.into_reader())
        }
    }

    impl<'a> FromStructBuilder<'a> for Builder<'a> {
        fn new(builder: StructBuilder<'a>) -> Self {
            Builder { builder }
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Self {
            Builder::new(builder.init_struct(u32::from(SIZE.data), SIZE.pointers))
        }

        fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Self> {
            Ok(Builder::new(builder.get_struct(u32::from(SIZE.data), SIZE.pointers, default)?))
        }
    }
}

/// A struct with a single `int32` field whose schema default is `100`,
/// stored on the wire as `actual_value XOR 100` per the default-XOR
/// convention.
mod counter {
    use super::*;

    pub const SIZE: StructSize = StructSize { data: 1, pointers: 0 };
    pub const DEFAULT: i32 = 100;

    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_value(&self) -> i32 {
            self.reader.get_data_field_masked::<i32>(0, DEFAULT)
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader<'a>> {
            Ok(Reader {
                reader: reader.get_struct(default)?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_value(&mut self, value: i32) {
            self.builder.set_data_field_masked::<i32>(0, value, DEFAULT);
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Self {
            Builder {
                builder: builder.init_struct(u32::from(SIZE.data), SIZE.pointers),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Self> {
            Ok(Builder {
                builder: builder.get_struct(u32::from(SIZE.data), SIZE.pointers, default)?,
            })
        }
    }
}

mod greeting {
    use super::*;

    #[derive(Clone, Copy)]
    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_message(&self) -> Result<capnp::text::Reader> {
            let inner = self.reader.get_pointer_field(0);
            capnp::text::Reader::get_from_pointer(&inner, None)
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader<'a>> {
            Ok(Reader {
                reader: reader.get_struct(default)?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn set_message(&mut self, value: &str) {
            let inner = self.builder.reborrow().get_pointer_field(0);
            <&str as SetPointerBuilder>::set_pointer_builder(inner, value, false).unwrap();
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Self {
            Builder {
                builder: builder.init_struct(0, 1),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Self> {
            Ok(Builder {
                builder: builder.get_struct(0, 1, default)?,
            })
        }
    }
}

/// A struct with a single pointer field holding `List(point::Point)`.
mod container {
    use super::*;

    pub struct Reader<'a> {
        reader: StructReader<'a>,
    }

    impl<'a> Reader<'a> {
        pub fn get_points(&self) -> Result<struct_list::Reader<'a, point::Owned>> {
            let inner = self.reader.get_pointer_field(0);
            struct_list::Reader::get_from_pointer(&inner, None)
        }
    }

    impl<'a> FromPointerReader<'a> for Reader<'a> {
        fn get_from_pointer(reader: &PointerReader<'a>, default: Option<&'a [Word]>) -> Result<Reader<'a>> {
            Ok(Reader {
                reader: reader.get_struct(default)?,
            })
        }
    }

    pub struct Builder<'a> {
        builder: StructBuilder<'a>,
    }

    impl<'a> Builder<'a> {
        pub fn init_points(self, count: u32) -> struct_list::Builder<'a, point::Owned> {
            let inner = self.builder.get_pointer_field(0);
            struct_list::Builder::init(inner, count, point::SIZE)
        }
    }

    impl<'a> FromPointerBuilder<'a> for Builder<'a> {
        fn init_pointer(builder: PointerBuilder<'a>, _size: u32) -> Self {
            Builder {
                builder: builder.init_struct(0, 1),
            }
        }

        fn get_from_pointer(builder: PointerBuilder<'a>, default: Option<&'a [Word]>) -> Result<Self> {
            Ok(Builder {
                builder: builder.get_struct(0, 1, default)?,
            })
        }
    }
}

#[test]
fn point_struct_round_trips() {
    let mut message = message::Builder::new_default();
    {
        let mut root: point::Builder = message.init_root();
        root.set_x(42);
        root.set_y(-7);
    }
    let reader = message.into_reader();
    let root: point::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_x(), 42);
    assert_eq!(root.get_y(), -7);
}

#[test]
fn unset_struct_fields_default_to_zero() {
    let mut message = message::Builder::new_default();
    {
        let _root: point::Builder = message.init_root();
    }
    let reader = message.into_reader();
    let root: point::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_x(), 0);
    assert_eq!(root.get_y(), 0);
}

#[test]
fn unset_field_with_nonzero_default_reads_as_the_default() {
    let mut message = message::Builder::new_default();
    {
        let _root: counter::Builder = message.init_root();
    }
    let reader = message.into_reader();
    let root: counter::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_value(), counter::DEFAULT);
}

#[test]
fn writing_the_default_value_reads_back_as_the_default() {
    let mut message = message::Builder::new_default();
    {
        let mut root: counter::Builder = message.init_root();
        root.set_value(counter::DEFAULT);
    }
    let reader = message.into_reader();
    let root: counter::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_value(), counter::DEFAULT);
}

#[test]
fn writing_a_non_default_value_round_trips() {
    let mut message = message::Builder::new_default();
    {
        let mut root: counter::Builder = message.init_root();
        root.set_value(7);
    }
    let reader = message.into_reader();
    let root: counter::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_value(), 7);
}

#[test]
fn text_field_access_excludes_the_nul_terminator() {
    let mut message = message::Builder::new_default();
    {
        let mut root: greeting::Builder = message.init_root();
        root.set_message("hi");
    }
    let reader = message.into_reader();
    let root: greeting::Reader = reader.get_root().unwrap();
    let text = root.get_message().unwrap();
    assert_eq!(text.as_str(), "hi");
    assert_eq!(text.len(), 2);
}

#[test]
fn far_pointer_relocates_an_oversized_root() {
    let mut message = message::Builder::new(
        HeapAllocator::new()
            .first_segment_words(2)
            .allocation_strategy(message::AllocationStrategy::FixedSize),
    );
    {
        let root: any_pointer::Builder = message.init_root();
        let mut big = root.init_struct_as(13, 0);
        big.set_data_field::<i64>(0, 0x1234_5678_90ab_cdefu64 as i64);
    }
    let reader = message.into_reader();
    assert!(reader.into_segments().len() >= 2);
}

#[test]
fn composite_list_of_structs_round_trips() {
    let mut message = message::Builder::new_default();
    {
        let mut root: container::Builder = message.init_root();
        let mut points = root.init_points(3);
        for i in 0..3u32 {
            let mut p = points.reborrow().get(i);
            p.set_x(i as i32);
            p.set_y(-(i as i32));
        }
    }
    let reader = message.into_reader();
    let root: container::Reader = reader.get_root().unwrap();
    let points = root.get_points().unwrap();
    assert_eq!(points.len(), 3);
    for i in 0..3u32 {
        let p = points.get(i);
        assert_eq!(p.get_x(), i as i32);
        assert_eq!(p.get_y(), -(i as i32));
    }
}

#[test]
fn wire_round_trip_through_framing_and_packing() {
    let mut message = message::Builder::new_default();
    {
        let mut root: point::Builder = message.init_root();
        root.set_x(1);
        root.set_y(2);
    }

    let words = capnp::serialize::write_message_to_words(&message);
    let packed = capnp::serialize_packed::pack(&words);
    let unpacked = capnp::serialize_packed::unpack(&packed).unwrap();
    assert_eq!(words, unpacked);

    let reader = capnp::serialize::read_message_from_words(&unpacked, ReaderOptions::new()).unwrap();
    let root: point::Reader = reader.get_root().unwrap();
    assert_eq!(root.get_x(), 1);
    assert_eq!(root.get_y(), 2);
}
