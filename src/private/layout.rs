// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! The wire-format layer: pointer encoding, struct/list storage, and the
//! reader/builder views generated code builds its typed accessors on top
//! of. Everything in this module works in terms of raw pointers into
//! segments owned by a [crate::private::arena::ReaderArena] /
//! [crate::private::arena::BuilderArena] -- bounds checking happens at
//! every pointer dereference, never anywhere else.

use alloc::string::ToString;

use crate::private::arena::{BuilderArena, ReadLimiter, ReaderArena};
use crate::private::units::*;
use crate::{Error, Word};
use crate::Result;

type BitCount32 = u32;
type ElementCount32 = u32;

/// The eight element layouts a Cap'n Proto list can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

use self::ElementSize::{Bit, Byte, EightBytes, FourBytes, InlineComposite, Pointer as PointerSize, TwoBytes, Void};

impl ElementSize {
    fn from_tag(tag: u8) -> ElementSize {
        match tag & 7 {
            0 => Void,
            1 => Bit,
            2 => Byte,
            3 => TwoBytes,
            4 => FourBytes,
            5 => EightBytes,
            6 => PointerSize,
            _ => InlineComposite,
        }
    }
}

/// The size, in words, of a struct's data and pointer sections. Generated
/// code bakes one of these per struct type; `List(Struct)` fields need it
/// to allocate a fresh composite list of the right element shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StructSize {
    pub data: u16,
    pub pointers: u16,
}

impl StructSize {
    pub fn total(&self) -> u32 {
        u32::from(self.data) + u32::from(self.pointers)
    }
}

/// Number of data bits occupied by one element of the given size. Zero for
/// `Void`, `Pointer`, and `InlineComposite` (whose data lives in the
/// per-element struct layout, addressed separately).
pub fn data_bits_per_element(size: ElementSize) -> BitCount32 {
    match size {
        Void | PointerSize | InlineComposite => 0,
        Bit => 1,
        Byte => 8,
        TwoBytes => 16,
        FourBytes => 32,
        EightBytes => 64,
    }
}

pub fn pointers_per_element(size: ElementSize) -> ElementCount32 {
    match size {
        PointerSize => 1,
        _ => 0,
    }
}

#[inline]
unsafe fn read_u64(ptr: *const u8) -> u64 {
    let mut bytes = [0u8; 8];
    core::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), 8);
    u64::from_le_bytes(bytes)
}

#[inline]
unsafe fn write_u64(ptr: *mut u8, value: u64) {
    let bytes = value.to_le_bytes();
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, 8);
}

/// The decoded shape of a 64-bit pointer word: null, struct, list, or far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirePointer {
    Null,
    Struct {
        offset: i32,
        data_words: u16,
        pointer_words: u16,
    },
    List {
        offset: i32,
        element_size: ElementSize,
        element_count: ElementCount32,
    },
    Far {
        double_far: bool,
        offset: u32,
        segment_id: u32,
    },
    /// Low 2 bits == 3. Reserved for capability pointers in the RPC layer;
    /// always an error in this core.
    Other,
}

fn decode_pointer(word: u64) -> WirePointer {
    if word == 0 {
        return WirePointer::Null;
    }
    let lower32 = word as u32;
    let upper32 = (word >> 32) as u32;
    match lower32 & 3 {
        0 => WirePointer::Struct {
            offset: (lower32 as i32) >> 2,
            data_words: upper32 as u16,
            pointer_words: (upper32 >> 16) as u16,
        },
        1 => WirePointer::List {
            offset: (lower32 as i32) >> 2,
            element_size: ElementSize::from_tag((upper32 & 7) as u8),
            element_count: upper32 >> 3,
        },
        2 => WirePointer::Far {
            double_far: (lower32 >> 2) & 1 != 0,
            offset: lower32 >> 3,
            segment_id: upper32,
        },
        _ => WirePointer::Other,
    }
}

fn encode_pointer(p: WirePointer) -> u64 {
    match p {
        WirePointer::Null => 0,
        WirePointer::Struct {
            offset,
            data_words,
            pointer_words,
        } => {
            assert!(
                (-(1 << 29)..(1 << 29)).contains(&offset),
                "struct pointer offset {offset} does not fit in 30 bits"
            );
            let lower32 = ((offset << 2) as u32) & !3;
            let upper32 = u32::from(data_words) | (u32::from(pointer_words) << 16);
            u64::from(lower32) | (u64::from(upper32) << 32)
        }
        WirePointer::List {
            offset,
            element_size,
            element_count,
        } => {
            assert!(
                (-(1 << 29)..(1 << 29)).contains(&offset),
                "list pointer offset {offset} does not fit in 30 bits"
            );
            assert!(
                element_count < (1 << 29),
                "list element count {element_count} does not fit in 29 bits"
            );
            let lower32 = (((offset << 2) as u32) & !3) | 1;
            let upper32 = (element_size as u32) | (element_count << 3);
            u64::from(lower32) | (u64::from(upper32) << 32)
        }
        WirePointer::Far {
            double_far,
            offset,
            segment_id,
        } => {
            assert!(offset < (1 << 29), "far pointer offset does not fit in 29 bits");
            let lower32 = (offset << 3) | (u32::from(double_far) << 2) | 2;
            u64::from(lower32) | (u64::from(segment_id) << 32)
        }
        WirePointer::Other => 3,
    }
}

/// Where a pointer/struct/list is anchored: either a real arena segment, or
/// a small schema-supplied default-value buffer (which is never far-pointer
/// indirected and carries no traversal limit).
#[derive(Clone, Copy)]
enum Location<'a> {
    Arena(&'a dyn ReaderArena, u32),
    Default(&'a [Word]),
}

impl<'a> Location<'a> {
    fn segment(&self) -> Result<(*const u8, u32)> {
        match *self {
            Location::Arena(arena, segment_id) => arena.get_segment(segment_id),
            Location::Default(words) => {
                let bytes = Word::words_to_bytes(words);
                Ok((bytes.as_ptr(), words.len() as u32))
            }
        }
    }

    fn arena(&self) -> Result<&'a dyn ReaderArena> {
        match *self {
            Location::Arena(arena, _) => Ok(arena),
            Location::Default(_) => Err(Error::failed(
                "far pointers are not allowed inside default values".to_string(),
            )),
        }
    }

    fn segment_id(&self) -> u32 {
        match *self {
            Location::Arena(_, id) => id,
            Location::Default(_) => 0,
        }
    }

    fn check_offset(&self, start: *const u8, offset_in_words: i32) -> Result<*const u8> {
        match *self {
            Location::Arena(arena, segment_id) => arena.check_offset(segment_id, start, offset_in_words),
            Location::Default(_) => {
                let (segment_start, segment_len) = self.segment()?;
                crate::private::arena::check_offset_raw(segment_start, segment_len, start, offset_in_words)
            }
        }
    }

    fn contains_interval(&self, start: *const u8, end: *const u8) -> Result<()> {
        match *self {
            Location::Arena(arena, segment_id) => arena.contains_interval(segment_id, start, end),
            Location::Default(_) => {
                let (segment_start, segment_len) = self.segment()?;
                crate::private::arena::contains_interval_raw(
                    segment_start,
                    segment_len,
                    start,
                    end,
                    &ReadLimiter::unlimited(),
                )
            }
        }
    }
}

fn read_pointer_word(pointer: *const u8) -> u64 {
    if pointer.is_null() {
        0
    } else {
        unsafe { read_u64(pointer) }
    }
}

// ===== Struct storage =====

/// A bounds-checked, read-only view of a struct's data and pointer
/// sections.
#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    location: Location<'a>,
    data: *const u8,
    data_size_words: u32,
    pointers: *const u8,
    pointer_count: u16,
    nesting_limit: i32,
}

impl<'a> StructReader<'a> {
    pub fn new_default() -> StructReader<'a> {
        StructReader {
            location: Location::Default(&[]),
            data: core::ptr::null(),
            data_size_words: 0,
            pointers: core::ptr::null(),
            pointer_count: 0,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn data_size_words(&self) -> u32 {
        self.data_size_words
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }

    fn get_data_byte(&self, offset: usize) -> u8 {
        if self.data.is_null() || offset >= self.data_size_words as usize * BYTES_PER_WORD {
            0
        } else {
            unsafe { *self.data.add(offset) }
        }
    }

    pub fn get_data_field<T: WireScalar>(&self, offset_words: usize) -> T {
        let byte_offset = offset_words * core::mem::size_of::<T>();
        if self.data.is_null()
            || byte_offset + core::mem::size_of::<T>() > self.data_size_words as usize * BYTES_PER_WORD
        {
            T::ZERO
        } else {
            unsafe { T::read(self.data.add(byte_offset)) }
        }
    }

    pub fn get_bool_field(&self, offset_bits: usize) -> bool {
        let byte = offset_bits / 8;
        let bit = offset_bits % 8;
        (self.get_data_byte(byte) >> bit) & 1 != 0
    }

    /// Reads a scalar field with a nonzero schema default: the wire stores
    /// `actual_value XOR default`, so the field reads as `default` when the
    /// underlying data is all-zero (unset).
    pub fn get_data_field_masked<T: WireScalar>(&self, offset_words: usize, mask: T) -> T {
        self.get_data_field::<T>(offset_words).xor(mask)
    }

    /// Bit-level equivalent of [`Self::get_data_field_masked`] for `bool` fields.
    pub fn get_bool_field_masked(&self, offset_bits: usize, mask: bool) -> bool {
        self.get_bool_field(offset_bits) ^ mask
    }

    pub fn get_pointer_field(&self, index: u16) -> PointerReader<'a> {
        if index >= self.pointer_count {
            PointerReader::new_default()
        } else {
            PointerReader {
                location: self.location,
                pointer: unsafe { self.pointers.add(index as usize * BYTES_PER_WORD) },
                nesting_limit: self.nesting_limit,
            }
        }
    }

    pub fn total_size(&self) -> Result<crate::MessageSize> {
        let mut result = crate::MessageSize {
            word_count: u64::from(self.data_size_words) + u64::from(self.pointer_count),
            cap_count: 0,
        };
        for i in 0..self.pointer_count {
            let child = self.get_pointer_field(i).total_size()?;
            result = result + child;
        }
        Ok(result)
    }
}

/// A bounds-checked, writable view of a struct's data and pointer sections.
pub struct StructBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: u32,
    data: *mut u8,
    data_size_words: u32,
    pointers: *mut u8,
    pointer_count: u16,
}

impl<'a> StructBuilder<'a> {
    pub fn data_size_words(&self) -> u32 {
        self.data_size_words
    }

    pub fn pointer_count(&self) -> u16 {
        self.pointer_count
    }

    pub fn set_data_field<T: WireScalar>(&mut self, offset_words: usize, value: T) {
        let byte_offset = offset_words * core::mem::size_of::<T>();
        debug_assert!(byte_offset + core::mem::size_of::<T>() <= self.data_size_words as usize * BYTES_PER_WORD);
        unsafe { T::write(self.data.add(byte_offset), value) }
    }

    pub fn get_data_field<T: WireScalar>(&self, offset_words: usize) -> T {
        let byte_offset = offset_words * core::mem::size_of::<T>();
        if byte_offset + core::mem::size_of::<T>() > self.data_size_words as usize * BYTES_PER_WORD {
            T::ZERO
        } else {
            unsafe { T::read(self.data.add(byte_offset)) }
        }
    }

    pub fn set_bool_field(&mut self, offset_bits: usize, value: bool) {
        let byte = offset_bits / 8;
        let bit = offset_bits % 8;
        unsafe {
            let ptr = self.data.add(byte);
            let old = *ptr;
            *ptr = if value { old | (1 << bit) } else { old & !(1 << bit) };
        }
    }

    pub fn get_bool_field(&self, offset_bits: usize) -> bool {
        let byte = offset_bits / 8;
        let bit = offset_bits % 8;
        if byte >= self.data_size_words as usize * BYTES_PER_WORD {
            false
        } else {
            (unsafe { *self.data.add(byte) } >> bit) & 1 != 0
        }
    }

    /// Writes a scalar field with a nonzero schema default: stores
    /// `value XOR default`, so an all-zero (unset) field reads back as
    /// `default`.
    pub fn set_data_field_masked<T: WireScalar>(&mut self, offset_words: usize, value: T, mask: T) {
        self.set_data_field(offset_words, value.xor(mask));
    }

    /// Reads back a field set with [`Self::set_data_field_masked`].
    pub fn get_data_field_masked<T: WireScalar>(&self, offset_words: usize, mask: T) -> T {
        self.get_data_field::<T>(offset_words).xor(mask)
    }

    /// Bit-level equivalent of [`Self::set_data_field_masked`] for `bool` fields.
    pub fn set_bool_field_masked(&mut self, offset_bits: usize, value: bool, mask: bool) {
        self.set_bool_field(offset_bits, value ^ mask);
    }

    /// Bit-level equivalent of [`Self::get_data_field_masked`] for `bool` fields.
    pub fn get_bool_field_masked(&self, offset_bits: usize, mask: bool) -> bool {
        self.get_bool_field(offset_bits) ^ mask
    }

    pub fn get_pointer_field(self, index: u16) -> PointerBuilder<'a> {
        assert!(index < self.pointer_count);
        let pointer = unsafe { self.pointers.add(index as usize * BYTES_PER_WORD) };
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer,
        }
    }

    pub fn reborrow(&mut self) -> StructBuilder<'_> {
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data: self.data,
            data_size_words: self.data_size_words,
            pointers: self.pointers,
            pointer_count: self.pointer_count,
        }
    }

    pub fn as_reader(&self) -> StructReader<'_> {
        StructReader {
            location: Location::Arena(self.arena.as_reader(), self.segment_id),
            data: self.data,
            data_size_words: self.data_size_words,
            pointers: self.pointers,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn into_reader(self) -> StructReader<'a> {
        StructReader {
            location: Location::Arena(self.arena.as_reader(), self.segment_id),
            data: self.data,
            data_size_words: self.data_size_words,
            pointers: self.pointers,
            pointer_count: self.pointer_count,
            nesting_limit: 0x7fffffff,
        }
    }
}

/// Allocates a zeroed struct of the given layout anywhere in the message.
fn alloc_struct_storage<'a>(
    arena: &'a mut dyn BuilderArena,
    preferred_segment: u32,
    data_words: u32,
    pointer_words: u16,
) -> StructBuilder<'a> {
    let total = data_words + pointer_words as u32;
    let (segment_id, ptr) = match arena.allocate(preferred_segment, total) {
        Some(result) => result,
        None => arena.allocate_anywhere(total),
    };
    StructBuilder {
        arena,
        segment_id,
        data: ptr,
        data_size_words: data_words,
        pointers: unsafe { ptr.add(data_words as usize * BYTES_PER_WORD) },
        pointer_count: pointer_words,
    }
}

// ===== Pointer reader/builder =====

#[derive(Clone, Copy)]
pub struct PointerReader<'a> {
    location: Location<'a>,
    pointer: *const u8,
    nesting_limit: i32,
}

impl<'a> PointerReader<'a> {
    pub fn new_default() -> PointerReader<'a> {
        PointerReader {
            location: Location::Default(&[]),
            pointer: core::ptr::null(),
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn get_root(
        arena: &'a dyn ReaderArena,
        segment_id: u32,
        location: *const u8,
        nesting_limit: i32,
    ) -> Result<PointerReader<'a>> {
        arena.contains_interval(segment_id, location, unsafe { location.add(BYTES_PER_WORD) })?;
        Ok(PointerReader {
            location: Location::Arena(arena, segment_id),
            pointer: location,
            nesting_limit,
        })
    }

    pub fn is_null(&self) -> bool {
        read_pointer_word(self.pointer) == 0
    }

    fn default_reader(default: Option<&'a [Word]>) -> Option<Location<'a>> {
        match default {
            Some(words) if !words.is_empty() && words.iter().any(|w| *w != Word::NULL) => {
                Some(Location::Default(words))
            }
            _ => None,
        }
    }

    pub fn get_struct(&self, default: Option<&'a [Word]>) -> Result<StructReader<'a>> {
        if self.is_null() {
            return match Self::default_reader(default) {
                Some(Location::Default(words)) => {
                    let bytes = Word::words_to_bytes(words);
                    let reader = PointerReader {
                        location: Location::Default(words),
                        pointer: bytes.as_ptr(),
                        nesting_limit: self.nesting_limit,
                    };
                    reader.get_struct(None)
                }
                _ => Ok(StructReader::new_default()),
            };
        }
        let word = read_pointer_word(self.pointer);
        match decode_pointer(word) {
            WirePointer::Null => Ok(StructReader::new_default()),
            WirePointer::Struct {
                offset,
                data_words,
                pointer_words,
            } => {
                if self.nesting_limit <= 0 {
                    return Err(Error::failed("nesting limit exceeded".to_string()));
                }
                let target = self
                    .location
                    .check_offset(unsafe { self.pointer.add(BYTES_PER_WORD) }, offset)?;
                let end = unsafe { target.add((data_words as usize + pointer_words as usize) * BYTES_PER_WORD) };
                self.location.contains_interval(target, end)?;
                Ok(StructReader {
                    location: self.location,
                    data: target,
                    data_size_words: u32::from(data_words),
                    pointers: unsafe { target.add(data_words as usize * BYTES_PER_WORD) },
                    pointer_count: pointer_words,
                    nesting_limit: self.nesting_limit - 1,
                })
            }
            WirePointer::List { .. } => Err(Error::failed(
                "message contains a list pointer where a struct pointer was expected".to_string(),
            )),
            WirePointer::Far {
                double_far,
                offset,
                segment_id,
            } => self.follow_far_to_struct(double_far, offset, segment_id),
            WirePointer::Other => Err(Error::failed(
                "unsupported pointer type (capabilities are not supported by this core)".to_string(),
            )),
        }
    }

    fn follow_far_to_struct(
        &self,
        double_far: bool,
        offset: u32,
        segment_id: u32,
    ) -> Result<StructReader<'a>> {
        let arena = self.location.arena()?;
        let (segment_start, _) = arena.get_segment(segment_id)?;
        let landing_pad = unsafe { segment_start.add(offset as usize * BYTES_PER_WORD) };
        if !double_far {
            arena.contains_interval(segment_id, landing_pad, unsafe { landing_pad.add(BYTES_PER_WORD) })?;
            let location = Location::Arena(arena, segment_id);
            let inner = PointerReader {
                location,
                pointer: landing_pad,
                nesting_limit: self.nesting_limit,
            };
            match decode_pointer(unsafe { read_u64(landing_pad) }) {
                WirePointer::Far { .. } => {
                    Err(Error::failed("far pointer chain is too deep".to_string()))
                }
                _ => inner.get_struct(None),
            }
        } else {
            arena.contains_interval(segment_id, landing_pad, unsafe { landing_pad.add(2 * BYTES_PER_WORD) })?;
            let far_word = unsafe { read_u64(landing_pad) };
            let tag_word = unsafe { read_u64(landing_pad.add(BYTES_PER_WORD)) };
            let (content_segment, content_offset) = match decode_pointer(far_word) {
                WirePointer::Far {
                    double_far: false,
                    offset,
                    segment_id,
                } => (segment_id, offset),
                _ => {
                    return Err(Error::failed(
                        "double-far landing pad's first word must be a single far pointer".to_string(),
                    ));
                }
            };
            let (data_words, pointer_words) = match decode_pointer(tag_word) {
                WirePointer::Struct {
                    data_words,
                    pointer_words,
                    ..
                } => (data_words, pointer_words),
                _ => {
                    return Err(Error::failed(
                        "double-far landing pad's tag word must describe a struct".to_string(),
                    ));
                }
            };
            let (content_start, _) = arena.get_segment(content_segment)?;
            let target = unsafe { content_start.add(content_offset as usize * BYTES_PER_WORD) };
            let end = unsafe { target.add((data_words as usize + pointer_words as usize) * BYTES_PER_WORD) };
            arena.contains_interval(content_segment, target, end)?;
            Ok(StructReader {
                location: Location::Arena(arena, content_segment),
                data: target,
                data_size_words: u32::from(data_words),
                pointers: unsafe { target.add(data_words as usize * BYTES_PER_WORD) },
                pointer_count: pointer_words,
                nesting_limit: self.nesting_limit - 1,
            })
        }
    }

    pub fn get_list(
        &self,
        expected_element_size: ElementSize,
        default: Option<&'a [Word]>,
    ) -> Result<ListReader<'a>> {
        if self.is_null() {
            return match Self::default_reader(default) {
                Some(Location::Default(words)) => {
                    let bytes = Word::words_to_bytes(words);
                    let reader = PointerReader {
                        location: Location::Default(words),
                        pointer: bytes.as_ptr(),
                        nesting_limit: self.nesting_limit,
                    };
                    reader.get_list(expected_element_size, None)
                }
                _ => Ok(ListReader::new_default()),
            };
        }
        let word = read_pointer_word(self.pointer);
        match decode_pointer(word) {
            WirePointer::Null => Ok(ListReader::new_default()),
            WirePointer::List {
                offset,
                element_size,
                element_count,
            } => {
                if self.nesting_limit <= 0 {
                    return Err(Error::failed("nesting limit exceeded".to_string()));
                }
                build_list_reader(
                    self.location,
                    unsafe { self.pointer.add(BYTES_PER_WORD) },
                    offset,
                    element_size,
                    element_count,
                    self.nesting_limit,
                )
            }
            WirePointer::Struct { .. } => Err(Error::failed(
                "message contains a struct pointer where a list pointer was expected".to_string(),
            )),
            WirePointer::Far {
                double_far,
                offset,
                segment_id,
            } => self.follow_far_to_list(double_far, offset, segment_id, expected_element_size),
            WirePointer::Other => Err(Error::failed(
                "unsupported pointer type (capabilities are not supported by this core)".to_string(),
            )),
        }
    }

    fn follow_far_to_list(
        &self,
        double_far: bool,
        offset: u32,
        segment_id: u32,
        expected_element_size: ElementSize,
    ) -> Result<ListReader<'a>> {
        let arena = self.location.arena()?;
        let (segment_start, _) = arena.get_segment(segment_id)?;
        let landing_pad = unsafe { segment_start.add(offset as usize * BYTES_PER_WORD) };
        if !double_far {
            arena.contains_interval(segment_id, landing_pad, unsafe { landing_pad.add(BYTES_PER_WORD) })?;
            let location = Location::Arena(arena, segment_id);
            let inner = PointerReader {
                location,
                pointer: landing_pad,
                nesting_limit: self.nesting_limit,
            };
            match decode_pointer(unsafe { read_u64(landing_pad) }) {
                WirePointer::Far { .. } => {
                    Err(Error::failed("far pointer chain is too deep".to_string()))
                }
                _ => inner.get_list(expected_element_size, None),
            }
        } else {
            arena.contains_interval(segment_id, landing_pad, unsafe { landing_pad.add(2 * BYTES_PER_WORD) })?;
            let far_word = unsafe { read_u64(landing_pad) };
            let tag_word = unsafe { read_u64(landing_pad.add(BYTES_PER_WORD)) };
            let (content_segment, content_offset) = match decode_pointer(far_word) {
                WirePointer::Far {
                    double_far: false,
                    offset,
                    segment_id,
                } => (segment_id, offset),
                _ => {
                    return Err(Error::failed(
                        "double-far landing pad's first word must be a single far pointer".to_string(),
                    ));
                }
            };
            let (element_size, element_count) = match decode_pointer(tag_word) {
                WirePointer::List {
                    element_size,
                    element_count,
                    ..
                } => (element_size, element_count),
                _ => {
                    return Err(Error::failed(
                        "double-far landing pad's tag word must describe a list".to_string(),
                    ));
                }
            };
            let (content_start, _) = arena.get_segment(content_segment)?;
            let target = unsafe { content_start.add(content_offset as usize * BYTES_PER_WORD) };
            build_list_reader(
                Location::Arena(arena, content_segment),
                target,
                0,
                element_size,
                element_count,
                self.nesting_limit,
            )
        }
    }

    pub fn total_size(&self) -> Result<crate::MessageSize> {
        if self.is_null() {
            return Ok(crate::MessageSize::default());
        }
        match decode_pointer(read_pointer_word(self.pointer)) {
            WirePointer::Null => Ok(crate::MessageSize::default()),
            WirePointer::Struct { .. } => {
                let s = self.get_struct(None)?;
                s.total_size()
            }
            WirePointer::List { .. } => {
                let l = self.get_list(ElementSize::Void, None)?;
                l.total_size()
            }
            _ => Ok(crate::MessageSize::default()),
        }
    }
}

pub struct PointerBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: u32,
    pointer: *mut u8,
}

impl<'a> PointerBuilder<'a> {
    pub fn get_root(arena: &'a mut dyn BuilderArena, segment_id: u32, location: *mut u8) -> PointerBuilder<'a> {
        PointerBuilder {
            arena,
            segment_id,
            pointer: location,
        }
    }

    pub fn is_null(&self) -> bool {
        unsafe { read_u64(self.pointer) == 0 }
    }

    pub fn reborrow(&mut self) -> PointerBuilder<'_> {
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer: self.pointer,
        }
    }

    pub fn as_reader(&self) -> PointerReader<'_> {
        PointerReader {
            location: Location::Arena(self.arena.as_reader(), self.segment_id),
            pointer: self.pointer,
            nesting_limit: 0x7fffffff,
        }
    }

    fn write_word(&mut self, word: u64) {
        unsafe { write_u64(self.pointer, word) }
    }

    /// Allocates fresh struct storage of the given layout and installs a
    /// pointer to it at `self`, overwriting whatever was there.
    pub fn init_struct(mut self, data_words: u32, pointer_words: u16) -> StructBuilder<'a> {
        self.clear();
        let mut storage = alloc_struct_storage(self.arena, self.segment_id, data_words, pointer_words);
        init_struct_pointer(self.pointer, self.segment_id, &mut storage);
        storage
    }

    /// Dereferences this pointer as a struct, allocating default storage of
    /// the given layout if the pointer is currently null, and upgrading
    /// in-place if the existing storage is smaller than requested.
    pub fn get_struct(self, data_words: u32, pointer_words: u16, default: Option<&[Word]>) -> Result<StructBuilder<'a>> {
        if self.is_null() {
            if let Some(words) = default {
                if words.iter().any(|w| *w != Word::NULL) {
                    // Seed with the default's data by deep-copying a reader
                    // over it, then continue as if it had been there all along.
                    let reader = PointerReader {
                        location: Location::Default(words),
                        pointer: Word::words_to_bytes(words).as_ptr(),
                        nesting_limit: 0x7fffffff,
                    }
                    .get_struct(None)?;
                    let mut builder = self.init_struct(data_words, pointer_words);
                    copy_struct_data(&reader, &mut builder);
                    return Ok(builder);
                }
            }
            return Ok(self.init_struct(data_words, pointer_words));
        }
        let word = unsafe { read_u64(self.pointer) };
        match decode_pointer(word) {
            WirePointer::Struct {
                offset,
                data_words: old_data,
                pointer_words: old_ptrs,
            } => {
                // Resolve the existing storage's location first, while only
                // borrowing the arena immutably; this ends before we move
                // `self.arena` below, so there's never a live mutable and
                // immutable borrow of the same arena at once.
                let (segment_start, segment_len) = self.arena.get_segment(self.segment_id)?;
                let target = crate::private::arena::check_offset_raw(
                    segment_start,
                    segment_len,
                    unsafe { self.pointer.add(BYTES_PER_WORD) as *const u8 },
                    offset,
                )?;
                if u32::from(old_data) >= data_words && old_ptrs >= pointer_words {
                    Ok(StructBuilder {
                        arena: self.arena,
                        segment_id: self.segment_id,
                        data: target as *mut u8,
                        data_size_words: u32::from(old_data),
                        pointers: unsafe { target.add(old_data as usize * BYTES_PER_WORD) } as *mut u8,
                        pointer_count: old_ptrs,
                    })
                } else {
                    let old_pointers = unsafe { target.add(old_data as usize * BYTES_PER_WORD) };
                    Ok(upgrade_struct(
                        self,
                        target,
                        u32::from(old_data),
                        old_pointers,
                        old_ptrs,
                        data_words,
                        pointer_words,
                    ))
                }
            }
            WirePointer::Null => Ok(self.init_struct(data_words, pointer_words)),
            _ => Err(Error::failed(
                "existing pointer is not a struct pointer".to_string(),
            )),
        }
    }

    pub fn init_list(mut self, element_size: ElementSize, element_count: ElementCount32) -> ListBuilder<'a> {
        self.clear();
        let mut builder = alloc_list_storage(self.arena, self.segment_id, element_size, element_count);
        init_list_pointer(self.pointer, self.segment_id, &mut builder);
        builder
    }

    pub fn init_composite_list(mut self, data_words: u32, pointer_words: u16, element_count: ElementCount32) -> ListBuilder<'a> {
        self.clear();
        let mut builder = alloc_composite_list_storage(self.arena, self.segment_id, data_words, pointer_words, element_count);
        init_list_pointer(self.pointer, self.segment_id, &mut builder);
        builder
    }

    /// Convenience wrapper over [`Self::init_composite_list`] for the
    /// `List(Struct)` case, where generated code already knows the
    /// element's [StructSize].
    pub fn init_struct_list(self, element_count: ElementCount32, element_size: StructSize) -> ListBuilder<'a> {
        self.init_composite_list(u32::from(element_size.data), element_size.pointers, element_count)
    }

    pub fn get_list(self, expected_element_size: ElementSize, default: Option<&[Word]>) -> Result<ListBuilder<'a>> {
        if self.is_null() {
            if default.map(|w| w.iter().any(|x| *x != Word::NULL)).unwrap_or(false) {
                // A list default is rare in practice (lists nested in struct
                // defaults); treat it the same way structs do.
                let words = default.unwrap();
                let reader = PointerReader {
                    location: Location::Default(words),
                    pointer: Word::words_to_bytes(words).as_ptr(),
                    nesting_limit: 0x7fffffff,
                }
                .get_list(expected_element_size, None)?;
                return Ok(deep_copy_list_into(self, &reader));
            }
            return Ok(self.init_list(expected_element_size, 0));
        }
        let word = unsafe { read_u64(self.pointer) };
        match decode_pointer(word) {
            WirePointer::List {
                offset,
                element_size,
                element_count,
            } => {
                // As in get_struct, resolve the target with only a short-lived
                // immutable borrow of the arena before self.arena is moved.
                let (segment_start, segment_len) = self.arena.get_segment(self.segment_id)?;
                let target = crate::private::arena::check_offset_raw(
                    segment_start,
                    segment_len,
                    unsafe { self.pointer.add(BYTES_PER_WORD) as *const u8 },
                    offset,
                )? as *mut u8;
                if element_size == InlineComposite {
                    let tag_word = unsafe { read_u64(target) };
                    let (count, data_words, pointer_words) = match decode_pointer(tag_word) {
                        WirePointer::Struct {
                            offset: count,
                            data_words,
                            pointer_words,
                        } => (count as u32, data_words, pointer_words),
                        _ => {
                            return Err(Error::failed(
                                "inline composite list's tag word must be a struct pointer".to_string(),
                            ));
                        }
                    };
                    let words_per_element = u64::from(data_words) + u64::from(pointer_words);
                    Ok(ListBuilder {
                        arena: self.arena,
                        segment_id: self.segment_id,
                        start: unsafe { target.add(BYTES_PER_WORD) },
                        element_count: count,
                        step_bits: (words_per_element * BITS_PER_WORD as u64) as u32,
                        element_size: InlineComposite,
                        struct_data_size_words: u32::from(data_words),
                        struct_pointer_count: pointer_words,
                    })
                } else {
                    let bits_per_element = data_bits_per_element(element_size)
                        + pointers_per_element(element_size) * BITS_PER_WORD as u32;
                    Ok(ListBuilder {
                        arena: self.arena,
                        segment_id: self.segment_id,
                        start: target,
                        element_count,
                        step_bits: bits_per_element,
                        element_size,
                        struct_data_size_words: if matches!(element_size, PointerSize) {
                            0
                        } else {
                            data_bits_per_element(element_size) / BITS_PER_WORD as u32
                        },
                        struct_pointer_count: pointers_per_element(element_size) as u16,
                    })
                }
            }
            WirePointer::Null => Ok(self.init_list(expected_element_size, 0)),
            _ => Err(Error::failed(
                "existing pointer is not a list pointer".to_string(),
            )),
        }
    }

    /// Sets this pointer to null, leaving whatever it pointed at
    /// unreachable and un-reclaimed until the whole message is torn down.
    pub fn clear(&mut self) {
        self.write_word(0);
    }

    pub fn set_list(&mut self, value: &ListReader<'_>, _canonicalize: bool) -> Result<()> {
        let mut builder = deep_copy_list(&mut *self.arena, self.segment_id, value)?;
        init_list_pointer(self.pointer, self.segment_id, &mut builder);
        Ok(())
    }

    pub fn set_struct(&mut self, value: &StructReader<'_>) -> Result<()> {
        let mut builder = deep_copy_struct(&mut *self.arena, self.segment_id, value)?;
        init_struct_pointer(self.pointer, self.segment_id, &mut builder);
        Ok(())
    }

    /// Shallow pointer copy, preserving identity where possible. Only
    /// valid when `src` and `self` live in the same message -- use
    /// [PointerBuilder::set_struct]/[PointerBuilder::set_list] (which
    /// deep-copy) across messages.
    pub fn copy_from(&mut self, src: PointerReader<'_>) -> Result<()> {
        if src.is_null() {
            self.clear();
            return Ok(());
        }
        match decode_pointer(read_pointer_word(src.pointer)) {
            WirePointer::Far { .. } => {
                self.write_word(read_pointer_word(src.pointer));
                Ok(())
            }
            WirePointer::Struct { .. } => self.set_struct(&src.get_struct(None)?),
            WirePointer::List { .. } => self.set_list(&src.get_list(ElementSize::Void, None)?, false),
            WirePointer::Null => {
                self.clear();
                Ok(())
            }
            WirePointer::Other => Err(Error::failed("cannot copy a capability pointer".to_string())),
        }
    }
}

fn copy_struct_data(src: &StructReader<'_>, dest: &mut StructBuilder<'_>) {
    let n = core::cmp::min(src.data_size_words, dest.data_size_words) as usize * BYTES_PER_WORD;
    if n > 0 && !src.data.is_null() {
        unsafe { core::ptr::copy_nonoverlapping(src.data, dest.data, n) };
    }
    let p = core::cmp::min(src.pointer_count, dest.pointer_count);
    for i in 0..p {
        let src_ptr = src.get_pointer_field(i);
        let mut dest_ptr = dest.reborrow().get_pointer_field(i);
        dest_ptr.copy_from(src_ptr).expect("copy struct pointer field");
    }
}

/// If the physical layout is smaller than what's now expected, allocate
/// new storage, copy data words, and recursively copy pointers. The old
/// storage is left as-is; the resulting waste is accepted rather than
/// reclaimed, since this crate has no orphan/compaction machinery.
///
/// This operates entirely on raw pointers plus a single threaded
/// `&mut dyn BuilderArena`, rather than wrapping the old storage in a
/// `StructReader`: the old and new storage live in the same arena, and a
/// `StructReader`'s borrowed arena reference would otherwise have to stay
/// alive next to the `&mut` one `StructBuilder` needs to allocate and
/// write the new copy.
fn upgrade_struct<'a>(
    mut pointer: PointerBuilder<'a>,
    old_data: *const u8,
    old_data_words: u32,
    old_pointers: *const u8,
    old_pointer_count: u16,
    data_words: u32,
    pointer_words: u16,
) -> StructBuilder<'a> {
    let old_segment_id = pointer.segment_id;
    let new_data_words = core::cmp::max(data_words, old_data_words);
    let new_pointer_words = core::cmp::max(pointer_words, old_pointer_count);
    pointer.clear();
    let mut fresh = alloc_struct_storage(pointer.arena, pointer.segment_id, new_data_words, new_pointer_words);
    let n = core::cmp::min(old_data_words, new_data_words) as usize * BYTES_PER_WORD;
    if n > 0 && !old_data.is_null() {
        unsafe { core::ptr::copy_nonoverlapping(old_data, fresh.data, n) };
    }
    let p = core::cmp::min(old_pointer_count, new_pointer_words);
    let fresh_segment_id = fresh.segment_id;
    for i in 0..p {
        let src_ptr = unsafe { old_pointers.add(i as usize * BYTES_PER_WORD) };
        let dst_ptr = unsafe { fresh.pointers.add(i as usize * BYTES_PER_WORD) };
        relocate_pointer(&mut *fresh.arena, old_segment_id, src_ptr, fresh_segment_id, dst_ptr)
            .expect("relocate struct pointer field during upgrade");
    }
    init_struct_pointer(pointer.pointer, pointer.segment_id, &mut fresh);
    fresh
}

/// Follows `ptr` (in `segment_id`) to the absolute location of whatever it
/// points at, resolving any far-pointer indirection, without touching the
/// message's data otherwise. Returns the target's segment, its content
/// start, and its shape (struct/list) with the offset field zeroed.
fn resolve_pointer_target(
    arena: &mut dyn BuilderArena,
    segment_id: u32,
    ptr: *const u8,
) -> Result<Option<(u32, *const u8, WirePointer)>> {
    let word = unsafe { read_u64(ptr) };
    match decode_pointer(word) {
        WirePointer::Null => Ok(None),
        WirePointer::Struct {
            offset,
            data_words,
            pointer_words,
        } => {
            let target = unsafe { ptr.add(BYTES_PER_WORD).offset(offset as isize * BYTES_PER_WORD as isize) };
            Ok(Some((
                segment_id,
                target,
                WirePointer::Struct {
                    offset: 0,
                    data_words,
                    pointer_words,
                },
            )))
        }
        WirePointer::List {
            offset,
            element_size,
            element_count,
        } => {
            let target = unsafe { ptr.add(BYTES_PER_WORD).offset(offset as isize * BYTES_PER_WORD as isize) };
            Ok(Some((
                segment_id,
                target,
                WirePointer::List {
                    offset: 0,
                    element_size,
                    element_count,
                },
            )))
        }
        WirePointer::Far {
            double_far,
            offset,
            segment_id: far_segment,
        } => {
            let (segment_start, _) = arena.get_segment(far_segment)?;
            let landing_pad = unsafe { segment_start.add(offset as usize * BYTES_PER_WORD) };
            if !double_far {
                resolve_pointer_target(arena, far_segment, landing_pad)
            } else {
                let far_word = unsafe { read_u64(landing_pad) };
                let tag_word = unsafe { read_u64(landing_pad.add(BYTES_PER_WORD)) };
                let (content_segment, content_offset) = match decode_pointer(far_word) {
                    WirePointer::Far {
                        double_far: false,
                        offset,
                        segment_id,
                    } => (segment_id, offset),
                    _ => {
                        return Err(Error::failed(
                            "double-far landing pad's first word must be a single far pointer".to_string(),
                        ));
                    }
                };
                let shape = match decode_pointer(tag_word) {
                    s @ WirePointer::Struct { .. } => s,
                    s @ WirePointer::List { .. } => s,
                    _ => {
                        return Err(Error::failed(
                            "double-far landing pad's tag word must describe a struct or list".to_string(),
                        ));
                    }
                };
                let (content_start, _) = arena.get_segment(content_segment)?;
                let target = unsafe { content_start.add(content_offset as usize * BYTES_PER_WORD) };
                Ok(Some((content_segment, target, shape)))
            }
        }
        WirePointer::Other => Err(Error::failed("cannot relocate a capability pointer".to_string())),
    }
}

/// Writes a pointer at `dst_ptr` (in `new_segment_id`) that points at
/// whatever `src_ptr` (in `old_segment_id`) points at, choosing a near or
/// far encoding as appropriate. Used by [upgrade_struct] to relocate
/// pointer fields that moved within the same message.
fn relocate_pointer(
    arena: &mut dyn BuilderArena,
    old_segment_id: u32,
    src_ptr: *const u8,
    new_segment_id: u32,
    dst_ptr: *mut u8,
) -> Result<()> {
    match resolve_pointer_target(arena, old_segment_id, src_ptr)? {
        None => {
            unsafe { write_u64(dst_ptr, 0) };
            Ok(())
        }
        Some((target_segment, target_ptr, shape)) => {
            if target_segment == new_segment_id {
                let offset = word_offset_between(unsafe { dst_ptr.add(BYTES_PER_WORD) as *const u8 }, target_ptr as *mut u8);
                let reshaped = match shape {
                    WirePointer::Struct {
                        data_words,
                        pointer_words,
                        ..
                    } => WirePointer::Struct {
                        offset,
                        data_words,
                        pointer_words,
                    },
                    WirePointer::List {
                        element_size,
                        element_count,
                        ..
                    } => WirePointer::List {
                        offset,
                        element_size,
                        element_count,
                    },
                    other => other,
                };
                unsafe { write_u64(dst_ptr, encode_pointer(reshaped)) };
            } else {
                write_far_pointer(dst_ptr, arena, new_segment_id, target_segment, target_ptr as *mut u8, shape);
            }
            Ok(())
        }
    }
}

// ===== List storage =====

#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    location: Location<'a>,
    start: *const u8,
    element_count: ElementCount32,
    step_bits: BitCount32,
    element_size: ElementSize,
    struct_data_size_words: u32,
    struct_pointer_count: u16,
    nesting_limit: i32,
}

fn build_list_reader<'a>(
    location: Location<'a>,
    after_pointer: *const u8,
    offset: i32,
    element_size: ElementSize,
    element_count: ElementCount32,
    nesting_limit: i32,
) -> Result<ListReader<'a>> {
    let target = location.check_offset(after_pointer, offset)?;
    if element_size == InlineComposite {
        let word_count = u64::from(element_count);
        location.contains_interval(target, unsafe { target.add((word_count as usize + 1) * BYTES_PER_WORD) })?;
        let tag_word = unsafe { read_u64(target) };
        let (count, data_words, pointer_words) = match decode_pointer(tag_word) {
            WirePointer::Struct {
                offset: count,
                data_words,
                pointer_words,
            } => (count as u32, data_words, pointer_words),
            _ => {
                return Err(Error::failed(
                    "inline composite list's tag word must be a struct pointer".to_string(),
                ));
            }
        };
        let words_per_element = u64::from(data_words) + u64::from(pointer_words);
        if words_per_element.saturating_mul(u64::from(count)) != word_count {
            return Err(Error::failed(
                "inline composite list's tag element count does not match its word count".to_string(),
            ));
        }
        Ok(ListReader {
            location,
            start: unsafe { target.add(BYTES_PER_WORD) },
            element_count: count,
            step_bits: (words_per_element * BITS_PER_WORD as u64) as u32,
            element_size: InlineComposite,
            struct_data_size_words: u32::from(data_words),
            struct_pointer_count: pointer_words,
            nesting_limit: nesting_limit - 1,
        })
    } else {
        let bits_per_element =
            data_bits_per_element(element_size) + pointers_per_element(element_size) * BITS_PER_WORD as u32;
        let total_bits = u64::from(bits_per_element) * u64::from(element_count);
        let byte_len = round_bits_up_to_bytes(total_bits);
        location.contains_interval(target, unsafe { target.add(byte_len) })?;
        Ok(ListReader {
            location,
            start: target,
            element_count,
            step_bits: bits_per_element,
            element_size,
            struct_data_size_words: if matches!(element_size, PointerSize) { 0 } else { data_bits_per_element(element_size) / BITS_PER_WORD as u32 },
            struct_pointer_count: pointers_per_element(element_size) as u16,
            nesting_limit: nesting_limit - 1,
        })
    }
}

impl<'a> ListReader<'a> {
    pub fn new_default() -> ListReader<'a> {
        ListReader {
            location: Location::Default(&[]),
            start: core::ptr::null(),
            element_count: 0,
            step_bits: 0,
            element_size: Void,
            struct_data_size_words: 0,
            struct_pointer_count: 0,
            nesting_limit: 0x7fffffff,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn get_element_size(&self) -> ElementSize {
        self.element_size
    }

    pub fn into_raw_bytes(self) -> &'a [u8] {
        if self.start.is_null() {
            &[]
        } else {
            let total_bits = u64::from(self.step_bits) * u64::from(self.element_count);
            unsafe { core::slice::from_raw_parts(self.start, round_bits_up_to_bytes(total_bits)) }
        }
    }

    fn element_ptr(&self, index: ElementCount32) -> *const u8 {
        unsafe { self.start.add((u64::from(index) * u64::from(self.step_bits) / 8) as usize) }
    }

    pub fn get_data_element<T: WireScalar>(&self, index: ElementCount32) -> T {
        assert!(index < self.element_count);
        if self.start.is_null() {
            return T::ZERO;
        }
        unsafe { T::read(self.element_ptr(index)) }
    }

    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        assert!(index < self.element_count);
        if self.start.is_null() {
            return false;
        }
        let bit_offset = u64::from(index) * u64::from(self.step_bits);
        let byte = unsafe { *self.start.add((bit_offset / 8) as usize) };
        (byte >> (bit_offset % 8)) & 1 != 0
    }

    pub fn get_pointer_element(&self, index: ElementCount32) -> PointerReader<'a> {
        assert!(index < self.element_count);
        if self.start.is_null() {
            return PointerReader::new_default();
        }
        PointerReader {
            location: self.location,
            pointer: self.element_ptr(index),
            nesting_limit: self.nesting_limit,
        }
    }

    pub fn get_struct_element(&self, index: ElementCount32) -> StructReader<'a> {
        assert!(index < self.element_count);
        if self.start.is_null() {
            return StructReader::new_default();
        }
        let data = self.element_ptr(index);
        StructReader {
            location: self.location,
            data,
            data_size_words: self.struct_data_size_words,
            pointers: unsafe { data.add(self.struct_data_size_words as usize * BYTES_PER_WORD) },
            pointer_count: self.struct_pointer_count,
            nesting_limit: self.nesting_limit,
        }
    }

    pub fn total_size(&self) -> Result<crate::MessageSize> {
        let mut result = crate::MessageSize::default();
        match self.element_size {
            InlineComposite => {
                result.word_count += 1
                    + u64::from(self.element_count)
                        * (u64::from(self.struct_data_size_words) + u64::from(self.struct_pointer_count));
                for i in 0..self.element_count {
                    let s = self.get_struct_element(i);
                    for p in 0..s.pointer_count {
                        result = result + s.get_pointer_field(p).total_size()?;
                    }
                }
            }
            PointerSize => {
                result.word_count += u64::from(self.element_count);
                for i in 0..self.element_count {
                    result = result + self.get_pointer_element(i).total_size()?;
                }
            }
            _ => {
                result.word_count += round_bits_up_to_words(u64::from(self.step_bits) * u64::from(self.element_count)) as u64;
            }
        }
        Ok(result)
    }
}

pub struct ListBuilder<'a> {
    arena: &'a mut dyn BuilderArena,
    segment_id: u32,
    start: *mut u8,
    element_count: ElementCount32,
    step_bits: BitCount32,
    element_size: ElementSize,
    struct_data_size_words: u32,
    struct_pointer_count: u16,
}

fn alloc_list_storage<'a>(
    arena: &'a mut dyn BuilderArena,
    preferred_segment: u32,
    element_size: ElementSize,
    element_count: ElementCount32,
) -> ListBuilder<'a> {
    assert_ne!(element_size, InlineComposite, "use alloc_composite_list_storage");
    let bits_per_element =
        data_bits_per_element(element_size) + pointers_per_element(element_size) * BITS_PER_WORD as u32;
    let total_words = round_bits_up_to_words(u64::from(bits_per_element) * u64::from(element_count));
    let (segment_id, ptr) = match arena.allocate(preferred_segment, total_words) {
        Some(result) => result,
        None => arena.allocate_anywhere(total_words),
    };
    ListBuilder {
        arena,
        segment_id,
        start: ptr,
        element_count,
        step_bits: bits_per_element,
        element_size,
        struct_data_size_words: if matches!(element_size, PointerSize) { 0 } else { data_bits_per_element(element_size) / BITS_PER_WORD as u32 },
        struct_pointer_count: pointers_per_element(element_size) as u16,
    }
}

fn alloc_composite_list_storage<'a>(
    arena: &'a mut dyn BuilderArena,
    preferred_segment: u32,
    data_words: u32,
    pointer_words: u16,
    element_count: ElementCount32,
) -> ListBuilder<'a> {
    let words_per_element = data_words + u32::from(pointer_words);
    let total_words = 1 + words_per_element * element_count;
    let (segment_id, ptr) = match arena.allocate(preferred_segment, total_words) {
        Some(result) => result,
        None => arena.allocate_anywhere(total_words),
    };
    unsafe {
        write_u64(
            ptr,
            encode_pointer(WirePointer::Struct {
                offset: element_count as i32,
                data_words: data_words as u16,
                pointer_words,
            }),
        );
    }
    ListBuilder {
        arena,
        segment_id,
        start: unsafe { ptr.add(BYTES_PER_WORD) },
        element_count,
        step_bits: words_per_element * BITS_PER_WORD as u32,
        element_size: InlineComposite,
        struct_data_size_words: data_words,
        struct_pointer_count: pointer_words,
    }
}

impl<'a> ListBuilder<'a> {
    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn get_element_size(&self) -> ElementSize {
        self.element_size
    }

    fn element_ptr(&self, index: ElementCount32) -> *mut u8 {
        unsafe { self.start.add((u64::from(index) * u64::from(self.step_bits) / 8) as usize) }
    }

    pub fn as_raw_bytes(&mut self) -> &mut [u8] {
        let total_bits = u64::from(self.step_bits) * u64::from(self.element_count);
        unsafe { core::slice::from_raw_parts_mut(self.start, round_bits_up_to_bytes(total_bits)) }
    }

    pub fn set_data_element<T: WireScalar>(&self, index: ElementCount32, value: T) {
        assert!(index < self.element_count);
        unsafe { T::write(self.element_ptr(index), value) }
    }

    pub fn get_data_element<T: WireScalar>(&self, index: ElementCount32) -> T {
        assert!(index < self.element_count);
        unsafe { T::read(self.element_ptr(index)) }
    }

    pub fn set_bool_element(&self, index: ElementCount32, value: bool) {
        assert!(index < self.element_count);
        let bit_offset = u64::from(index) * u64::from(self.step_bits);
        unsafe {
            let ptr = self.start.add((bit_offset / 8) as usize);
            let old = *ptr;
            let bit = bit_offset % 8;
            *ptr = if value { old | (1 << bit) } else { old & !(1 << bit) };
        }
    }

    pub fn get_bool_element(&self, index: ElementCount32) -> bool {
        assert!(index < self.element_count);
        let bit_offset = u64::from(index) * u64::from(self.step_bits);
        let byte = unsafe { *self.start.add((bit_offset / 8) as usize) };
        (byte >> (bit_offset % 8)) & 1 != 0
    }

    pub fn get_pointer_element(self, index: ElementCount32) -> PointerBuilder<'a> {
        assert!(index < self.element_count);
        let pointer = self.element_ptr(index);
        PointerBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            pointer,
        }
    }

    pub fn get_struct_element(self, index: ElementCount32) -> StructBuilder<'a> {
        assert!(index < self.element_count);
        let data = self.element_ptr(index);
        StructBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            data,
            data_size_words: self.struct_data_size_words,
            pointers: unsafe { data.add(self.struct_data_size_words as usize * BYTES_PER_WORD) },
            pointer_count: self.struct_pointer_count,
        }
    }

    pub fn reborrow(&mut self) -> ListBuilder<'_> {
        ListBuilder {
            arena: self.arena,
            segment_id: self.segment_id,
            start: self.start,
            element_count: self.element_count,
            step_bits: self.step_bits,
            element_size: self.element_size,
            struct_data_size_words: self.struct_data_size_words,
            struct_pointer_count: self.struct_pointer_count,
        }
    }

    pub fn into_reader(self) -> ListReader<'a> {
        ListReader {
            location: Location::Arena(self.arena.as_reader(), self.segment_id),
            start: self.start,
            element_count: self.element_count,
            step_bits: self.step_bits,
            element_size: self.element_size,
            struct_data_size_words: self.struct_data_size_words,
            struct_pointer_count: self.struct_pointer_count,
            nesting_limit: 0x7fffffff,
        }
    }
}

// ===== Pointer initialization =====

fn init_struct_pointer(pointer: *mut u8, pointer_segment_id: u32, storage: &mut StructBuilder<'_>) {
    if storage.segment_id == pointer_segment_id {
        let offset = word_offset_between(unsafe { pointer.add(BYTES_PER_WORD) }, storage.data);
        unsafe {
            write_u64(
                pointer,
                encode_pointer(WirePointer::Struct {
                    offset,
                    data_words: storage.data_size_words as u16,
                    pointer_words: storage.pointer_count,
                }),
            );
        }
        return;
    }
    write_far_pointer(
        pointer,
        &mut *storage.arena,
        pointer_segment_id,
        storage.segment_id,
        storage.data,
        WirePointer::Struct {
            offset: 0,
            data_words: storage.data_size_words as u16,
            pointer_words: storage.pointer_count,
        },
    );
}

fn init_list_pointer(pointer: *mut u8, pointer_segment_id: u32, storage: &mut ListBuilder<'_>) {
    let count = if storage.element_size == InlineComposite {
        // total payload words; the tag word occupies one extra word that
        // is not counted here.
        let words_per_element = storage.struct_data_size_words + u32::from(storage.struct_pointer_count);
        words_per_element * storage.element_count
    } else {
        storage.element_count
    };
    let target_data = if storage.element_size == InlineComposite {
        unsafe { storage.start.sub(BYTES_PER_WORD) }
    } else {
        storage.start
    };
    if storage.segment_id == pointer_segment_id {
        let offset = word_offset_between(unsafe { pointer.add(BYTES_PER_WORD) }, target_data);
        unsafe {
            write_u64(
                pointer,
                encode_pointer(WirePointer::List {
                    offset,
                    element_size: storage.element_size,
                    element_count: count,
                }),
            );
        }
        return;
    }
    write_far_pointer(
        pointer,
        &mut *storage.arena,
        pointer_segment_id,
        storage.segment_id,
        target_data,
        WirePointer::List {
            offset: 0,
            element_size: storage.element_size,
            element_count: count,
        },
    );
}

fn word_offset_between(after_pointer: *const u8, target: *mut u8) -> i32 {
    let diff = target as isize - after_pointer as isize;
    debug_assert_eq!(diff % BYTES_PER_WORD as isize, 0);
    (diff / BYTES_PER_WORD as isize) as i32
}

/// Installs a far pointer at `pointer`, choosing between a single and a
/// double landing pad depending on whether the content segment has room
/// for a one-word landing pad.
fn write_far_pointer(
    pointer: *mut u8,
    arena: &mut dyn BuilderArena,
    pointer_segment_id: u32,
    content_segment_id: u32,
    content: *mut u8,
    shape: WirePointer,
) {
    if let Some((_, pad)) = arena.allocate(content_segment_id, 1) {
        let offset = word_offset_between(unsafe { pad.add(BYTES_PER_WORD) }, content);
        let reshaped = match shape {
            WirePointer::Struct {
                data_words,
                pointer_words,
                ..
            } => WirePointer::Struct {
                offset,
                data_words,
                pointer_words,
            },
            WirePointer::List {
                element_size,
                element_count,
                ..
            } => WirePointer::List {
                offset,
                element_size,
                element_count,
            },
            other => other,
        };
        unsafe { write_u64(pad, encode_pointer(reshaped)) };
        unsafe {
            write_u64(
                pointer,
                encode_pointer(WirePointer::Far {
                    double_far: false,
                    offset: (word_offset_from_segment_start(arena, content_segment_id, pad)) as u32,
                    segment_id: content_segment_id,
                }),
            );
        }
    } else {
        let (landing_segment, landing) = arena.allocate_anywhere(2);
        let far_offset = word_offset_from_segment_start(arena, content_segment_id, content);
        unsafe {
            write_u64(
                landing,
                encode_pointer(WirePointer::Far {
                    double_far: false,
                    offset: far_offset as u32,
                    segment_id: content_segment_id,
                }),
            );
            write_u64(landing.add(BYTES_PER_WORD), encode_pointer(shape));
        }
        unsafe {
            write_u64(
                pointer,
                encode_pointer(WirePointer::Far {
                    double_far: true,
                    offset: word_offset_from_segment_start(arena, landing_segment, landing) as u32,
                    segment_id: landing_segment,
                }),
            );
        }
    }
}

fn word_offset_from_segment_start(arena: &dyn BuilderArena, segment_id: u32, ptr: *const u8) -> u32 {
    let (segment_start, _) = ReaderArena::get_segment(arena, segment_id).expect("segment exists");
    ((ptr as usize - segment_start as usize) / BYTES_PER_WORD) as u32
}

// ===== Deep copy =====

fn deep_copy_struct<'a>(
    arena: &'a mut dyn BuilderArena,
    preferred_segment: u32,
    src: &StructReader<'_>,
) -> Result<StructBuilder<'a>> {
    let mut dest = alloc_struct_storage(arena, preferred_segment, src.data_size_words, src.pointer_count);
    if src.data_size_words > 0 && !src.data.is_null() {
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.data,
                dest.data,
                src.data_size_words as usize * BYTES_PER_WORD,
            )
        };
    }
    for i in 0..src.pointer_count {
        let child = src.get_pointer_field(i);
        let mut dest_ptr = dest.reborrow().get_pointer_field(i);
        dest_ptr.set_pointer_from_reader(&child)?;
    }
    Ok(dest)
}

fn deep_copy_list<'a>(
    arena: &'a mut dyn BuilderArena,
    preferred_segment: u32,
    src: &ListReader<'_>,
) -> Result<ListBuilder<'a>> {
    match src.element_size {
        InlineComposite => {
            let mut dest = alloc_composite_list_storage(
                arena,
                preferred_segment,
                src.struct_data_size_words,
                src.struct_pointer_count,
                src.element_count,
            );
            for i in 0..src.element_count {
                let s = src.get_struct_element(i);
                let mut d = dest.reborrow().get_struct_element(i);
                if s.data_size_words > 0 && !s.data.is_null() {
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            s.data,
                            d.data,
                            s.data_size_words as usize * BYTES_PER_WORD,
                        )
                    };
                }
                for p in 0..s.pointer_count {
                    let child = s.get_pointer_field(p);
                    let mut dest_ptr = d.reborrow().get_pointer_field(p);
                    dest_ptr.set_pointer_from_reader(&child)?;
                }
            }
            Ok(dest)
        }
        PointerSize => {
            let mut dest = alloc_list_storage(arena, preferred_segment, PointerSize, src.element_count);
            for i in 0..src.element_count {
                let child = src.get_pointer_element(i);
                let mut dest_ptr = dest.reborrow().get_pointer_element(i);
                dest_ptr.set_pointer_from_reader(&child)?;
            }
            Ok(dest)
        }
        _ => {
            let dest = alloc_list_storage(arena, preferred_segment, src.element_size, src.element_count);
            let src_bytes = src.into_raw_bytes();
            if !src_bytes.is_empty() {
                unsafe { core::ptr::copy_nonoverlapping(src_bytes.as_ptr(), dest.start, src_bytes.len()) };
            }
            Ok(dest)
        }
    }
}

fn deep_copy_list_into<'a>(pointer: PointerBuilder<'a>, src: &ListReader<'_>) -> ListBuilder<'a> {
    let PointerBuilder {
        arena,
        segment_id,
        pointer: ptr,
    } = pointer;
    let mut builder = deep_copy_list(arena, segment_id, src).expect("deep copy default list");
    init_list_pointer(ptr, segment_id, &mut builder);
    builder
}

impl<'a> PointerBuilder<'a> {
    fn set_pointer_from_reader(&mut self, src: &PointerReader<'_>) -> Result<()> {
        if src.is_null() {
            self.clear();
            return Ok(());
        }
        match decode_pointer(read_pointer_word(src.pointer)) {
            WirePointer::Struct { .. } => self.set_struct(&src.get_struct(None)?),
            WirePointer::List { .. } => self.set_list(&src.get_list(Void, None)?, false),
            WirePointer::Null => {
                self.clear();
                Ok(())
            }
            WirePointer::Far { .. } => self.copy_from(*src),
            WirePointer::Other => Err(Error::failed("cannot deep-copy a capability pointer".to_string())),
        }
    }
}

// ===== Primitive element trait, used by primitive_list.rs =====

/// A fixed-width value that can be read/written at a byte offset within a
/// struct's data section, a list element, or a scalar field -- with the
/// "default XOR" trick folded in by the caller.
pub trait WireScalar: Copy {
    const ZERO: Self;
    /// # Safety
    /// `ptr` must point to at least `size_of::<Self>()` readable bytes.
    unsafe fn read(ptr: *const u8) -> Self;
    /// # Safety
    /// `ptr` must point to at least `size_of::<Self>()` writable bytes.
    unsafe fn write(ptr: *mut u8, value: Self);
    /// Bitwise XOR at the wire representation's bit pattern. Applying this
    /// twice with the same `mask` is the identity, which is what lets the
    /// same operation serve as both the masking and unmasking step of the
    /// default-XOR convention.
    fn xor(self, mask: Self) -> Self;
}

macro_rules! impl_wire_scalar {
    ($t:ty) => {
        impl WireScalar for $t {
            const ZERO: Self = 0;
            unsafe fn read(ptr: *const u8) -> Self {
                let mut bytes = [0u8; core::mem::size_of::<$t>()];
                core::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), bytes.len());
                <$t>::from_le_bytes(bytes)
            }
            unsafe fn write(ptr: *mut u8, value: Self) {
                let bytes = value.to_le_bytes();
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            }
            fn xor(self, mask: Self) -> Self {
                self ^ mask
            }
        }
    };
}

impl_wire_scalar!(u8);
impl_wire_scalar!(i8);
impl_wire_scalar!(u16);
impl_wire_scalar!(i16);
impl_wire_scalar!(u32);
impl_wire_scalar!(i32);
impl_wire_scalar!(u64);
impl_wire_scalar!(i64);

impl WireScalar for f32 {
    const ZERO: Self = 0.0;
    unsafe fn read(ptr: *const u8) -> Self {
        f32::from_bits(u32::read(ptr))
    }
    unsafe fn write(ptr: *mut u8, value: Self) {
        u32::write(ptr, value.to_bits())
    }
    fn xor(self, mask: Self) -> Self {
        f32::from_bits(self.to_bits() ^ mask.to_bits())
    }
}

impl WireScalar for f64 {
    const ZERO: Self = 0.0;
    unsafe fn read(ptr: *const u8) -> Self {
        f64::from_bits(u64::read(ptr))
    }
    unsafe fn write(ptr: *mut u8, value: Self) {
        u64::write(ptr, value.to_bits())
    }
    fn xor(self, mask: Self) -> Self {
        f64::from_bits(self.to_bits() ^ mask.to_bits())
    }
}

/// Implemented for every type that can appear as an element of a
/// `primitive_list`. Bundles the element-size tag with typed get/set so
/// that `primitive_list::{Reader,Builder}` never need an indirect
/// function-pointer table.
pub trait PrimitiveElement: Copy {
    fn element_size() -> ElementSize;
    fn get(list: &ListReader<'_>, index: ElementCount32) -> Self;
    fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self;
    fn set(list: &ListBuilder<'_>, index: ElementCount32, value: Self);
}

macro_rules! impl_primitive_element {
    ($t:ty, $size:expr) => {
        impl PrimitiveElement for $t {
            fn element_size() -> ElementSize {
                $size
            }
            fn get(list: &ListReader<'_>, index: ElementCount32) -> Self {
                list.get_data_element::<$t>(index)
            }
            fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self {
                list.get_data_element::<$t>(index)
            }
            fn set(list: &ListBuilder<'_>, index: ElementCount32, value: Self) {
                list.set_data_element::<$t>(index, value)
            }
        }
    };
}

impl_primitive_element!(u8, Byte);
impl_primitive_element!(i8, Byte);
impl_primitive_element!(u16, TwoBytes);
impl_primitive_element!(i16, TwoBytes);
impl_primitive_element!(u32, FourBytes);
impl_primitive_element!(i32, FourBytes);
impl_primitive_element!(u64, EightBytes);
impl_primitive_element!(i64, EightBytes);
impl_primitive_element!(f32, FourBytes);
impl_primitive_element!(f64, EightBytes);

impl PrimitiveElement for bool {
    fn element_size() -> ElementSize {
        Bit
    }
    fn get(list: &ListReader<'_>, index: ElementCount32) -> Self {
        list.get_bool_element(index)
    }
    fn get_from_builder(list: &ListBuilder<'_>, index: ElementCount32) -> Self {
        list.get_bool_element(index)
    }
    fn set(list: &ListBuilder<'_>, index: ElementCount32, value: Self) {
        list.set_bool_element(index, value)
    }
}

impl PrimitiveElement for () {
    fn element_size() -> ElementSize {
        Void
    }
    fn get(_list: &ListReader<'_>, _index: ElementCount32) -> Self {}
    fn get_from_builder(_list: &ListBuilder<'_>, _index: ElementCount32) -> Self {}
    fn set(_list: &ListBuilder<'_>, _index: ElementCount32, _value: Self) {}
}
