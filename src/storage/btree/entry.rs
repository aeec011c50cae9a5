use std::cmp::Ordering;

/// Stored value: a one-byte type tag followed by an opaque payload.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Value {
    /// Caller-defined type tag.
    pub tag: u8,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Value {
    /// Creates a value from a tag and payload.
    pub fn new(tag: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Length of the value as stored on a block (tag plus payload).
    pub fn marshalled_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Borrowed view of this value.
    pub fn view(&self) -> ValueRef<'_> {
        ValueRef {
            tag: self.tag,
            payload: &self.payload,
        }
    }
}

/// Borrowed view of a stored value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValueRef<'a> {
    /// Caller-defined type tag.
    pub tag: u8,
    /// Opaque payload bytes.
    pub payload: &'a [u8],
}

impl ValueRef<'_> {
    /// Copies the view into an owned [`Value`].
    pub fn to_value(&self) -> Value {
        Value::new(self.tag, self.payload)
    }

    /// Length of the value as stored on a block (tag plus payload).
    pub fn marshalled_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// Owned key/value pair.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Entry {
    /// Order-preserving encoded key.
    pub key: Vec<u8>,
    /// Associated value.
    pub value: Value,
}

impl Entry {
    /// Creates an entry.
    pub fn new(key: impl Into<Vec<u8>>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Key plus marshalled value length; the quantity bounded by the entry ceiling.
    pub fn marshalled_len(&self) -> usize {
        self.key.len() + self.value.marshalled_len()
    }
}

/// Borrowed key/value pair pointing into a block buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryRef<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Value view.
    pub value: ValueRef<'a>,
}

impl EntryRef<'_> {
    /// Copies the view into an owned [`Entry`].
    pub fn to_entry(&self) -> Entry {
        Entry {
            key: self.key.to_vec(),
            value: self.value.to_value(),
        }
    }
}

/// Byte-lexicographic key order; a strict prefix sorts first.
#[inline]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_sorts_first() {
        assert_eq!(compare_keys(b"ab", b"abc"), Ordering::Less);
        assert_eq!(compare_keys(b"", b"\x00"), Ordering::Less);
        assert_eq!(compare_keys(b"b", b"abc"), Ordering::Greater);
        assert_eq!(compare_keys(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn marshalled_len_counts_tag() {
        let entry = Entry::new(b"key".to_vec(), Value::new(3, vec![1, 2, 3, 4]));
        assert_eq!(entry.value.marshalled_len(), 5);
        assert_eq!(entry.marshalled_len(), 8);
    }
}
