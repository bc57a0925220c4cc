use crate::header::name::Name;
use bytesstr::BytesStr;
use std::fmt;

/// Simple container for SIP-Message headers.
///
/// The headers are stored as [BytesStr] under their respective [Name].
/// Internally it is a `Vec`-backed multimap to keep insertion order;
/// lookups compare names case-insensitively including compact forms.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: Name,
    values: Vec<BytesStr>,
}

impl Headers {
    #[inline]
    pub const fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a value under `name`, keeping any existing values
    pub fn insert<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        let name = name.into();

        if let Some(entry) = self.entry_mut(&name) {
            entry.values.push(value.into());
        } else {
            self.entries.push(Entry {
                name,
                values: vec![value.into()],
            });
        }
    }

    /// Replace every value stored under `name`
    pub fn set<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        let name = name.into();

        if let Some(entry) = self.entry_mut(&name) {
            entry.values.clear();
            entry.values.push(value.into());
        } else {
            self.entries.push(Entry {
                name,
                values: vec![value.into()],
            });
        }
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|entry| &entry.name == name)
    }

    /// First value stored under `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find(|entry| &entry.name == name)
            .and_then(|entry| entry.values.first())
    }

    /// All values stored under `name` in insertion order
    pub fn get_all<'s>(&'s self, name: &'s Name) -> impl Iterator<Item = &'s BytesStr> + 's {
        self.entries
            .iter()
            .filter(move |entry| &entry.name == name)
            .flat_map(|entry| entry.values.iter())
    }

    pub fn remove(&mut self, name: &Name) -> Vec<BytesStr> {
        let mut removed = Vec::new();

        self.entries.retain_mut(|entry| {
            if &entry.name == name {
                removed.append(&mut entry.values);
                false
            } else {
                true
            }
        });

        removed
    }

    /// Iterate over `(name, value)` pairs, one pair per stored value
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> + '_ {
        self.entries
            .iter()
            .flat_map(|entry| entry.values.iter().map(move |value| (&entry.name, value)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, name: &Name) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| &entry.name == name)
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name.as_print_str(), value)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_and_get_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Call-ID", "abc@host");

        assert_eq!(headers.get(&Name::CALL_ID).unwrap(), "abc@host");
        assert_eq!(headers.get(&Name::from("i")).unwrap(), "abc@host");
        assert!(headers.contains(&Name::CALL_ID));
    }

    #[test]
    fn multi_values_keep_order() {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "SIP/2.0/UDP a;branch=1");
        headers.insert(Name::VIA, "SIP/2.0/UDP b;branch=2");

        let vias: Vec<_> = headers.get_all(&Name::VIA).collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(vias[0], "SIP/2.0/UDP a;branch=1");

        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn set_replaces() {
        let mut headers = Headers::new();
        headers.insert(Name::MAX_FORWARDS, "70");
        headers.set(Name::MAX_FORWARDS, "69");

        let all: Vec<_> = headers.get_all(&Name::MAX_FORWARDS).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], "69");
    }

    #[test]
    fn display() {
        let mut headers = Headers::new();
        headers.insert(Name::MAX_FORWARDS, "70");
        headers.insert(Name::EXPIRES, "120");

        assert_eq!(headers.to_string(), "Max-Forwards: 70\r\nExpires: 120\r\n");
    }
}
