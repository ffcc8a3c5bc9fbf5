use std::ffi::{c_char, CStr, CString, NulError};

/// A machine-word-sized argument or result exchanged with the engine.
pub type Word = usize;

/// The two result registers of a native call.
pub type Words = (Word, Word);

/// Conversion of host values into a flat native argument word.
pub trait IntoWord {
    fn into_word(self) -> Word;
}

impl IntoWord for bool {
    fn into_word(self) -> Word {
        Word::from(self)
    }
}

impl IntoWord for f32 {
    fn into_word(self) -> Word {
        self.to_bits() as Word
    }
}

impl<T> IntoWord for *const T {
    fn into_word(self) -> Word {
        self as Word
    }
}

impl<T> IntoWord for *mut T {
    fn into_word(self) -> Word {
        self as Word
    }
}

macro_rules! int_into_word {
    ($($ty:ty),*) => {
        $(
            impl IntoWord for $ty {
                fn into_word(self) -> Word {
                    self as Word
                }
            }
        )*
    };
}

int_into_word!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Owned NUL-terminated UTF-8 string handed to the engine by pointer.
///
/// The buffer must outlive the call that receives [`NativeStr::word`].
#[derive(Debug, Clone)]
pub struct NativeStr(CString);

impl NativeStr {
    pub fn new(value: &str) -> Result<Self, NulError> {
        CString::new(value).map(Self)
    }

    pub fn word(&self) -> Word {
        self.0.as_ptr() as Word
    }
}

/// Owned NUL-terminated UTF-16 buffer for entry points taking `const wchar_t*`.
#[derive(Debug, Clone)]
pub struct WideStr(Vec<u16>);

impl WideStr {
    pub fn new(value: &str) -> Self {
        Self(value.encode_utf16().chain(std::iter::once(0)).collect())
    }

    pub fn word(&self) -> Word {
        self.0.as_ptr() as Word
    }
}

/// Read a `const utf8*` returned by the engine. A null pointer yields `None`.
///
/// # Safety
///
/// `word` must be null or point to a NUL-terminated buffer that stays valid
/// for the duration of this call.
pub unsafe fn read_c_str(word: Word) -> Option<String> {
    if word == 0 {
        return None;
    }
    let raw = word as *const c_char;
    Some(CStr::from_ptr(raw).to_string_lossy().into_owned())
}
