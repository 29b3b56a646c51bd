use std::fmt;
use std::str::FromStr;

/// The contents of a `/proc/PID/uid_map` or `/proc/PID/gid_map` file: an ordered list of ID
/// ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdMap {
    mappings: Vec<Mapping>,
}

/// Map the range of IDs `[inside_id, inside_id + length) --> [outside_id, outside_id + length)`
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
pub struct Mapping {
    pub inside_id: u32,
    pub outside_id: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdMapParseError {
    #[error("map string is empty")]
    Empty,

    #[error("record {index} ({record:?}) needs exactly three fields: inside outside length")]
    FieldCount { index: usize, record: String },

    #[error("record {index}: {field:?} is not a valid ID")]
    InvalidNumber { index: usize, field: String },
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap {
            mappings: Vec::new(),
        }
    }

    /// Map `outside_id` to ID 0 inside the namespace.
    pub fn zero_to(outside_id: u32) -> IdMap {
        let mut map = Self::new();
        map.map_one(0, outside_id);
        map
    }

    pub fn map_one(&mut self, inside_id: u32, outside_id: u32) {
        self.map_many(inside_id, outside_id, 1);
    }

    /// Append a record. Ranges are passed to the kernel as-is; overlap and limit checks are
    /// the kernel's.
    pub fn map_many(&mut self, inside_id: u32, outside_id: u32, length: u32) {
        self.mappings.push(Mapping {
            inside_id,
            outside_id,
            length,
        });
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Format the map in the style of a `/proc/PID/uid_map` file: one record per line, no
    /// trailing newline.
    pub fn to_proc_contents(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside_id, self.outside_id, self.length)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, mapping) in self.mappings.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{mapping}")?;
        }
        Ok(())
    }
}

/// Parses the command-line form: records of `inside outside length`, separated by commas. One
/// trailing separator is allowed.
impl FromStr for IdMap {
    type Err = IdMapParseError;

    fn from_str(s: &str) -> Result<IdMap, IdMapParseError> {
        let s = s.strip_suffix(|c: char| c == ',' || c == '\n').unwrap_or(s);
        if s.trim().is_empty() {
            return Err(IdMapParseError::Empty);
        }

        let mut map = IdMap::new();
        for (index, record) in s.split([',', '\n']).enumerate() {
            let fields: Vec<&str> = record.split_whitespace().collect();
            let &[inside, outside, length] = fields.as_slice() else {
                return Err(IdMapParseError::FieldCount {
                    index,
                    record: record.to_owned(),
                });
            };

            let parse = |field: &str| {
                field
                    .parse::<u32>()
                    .map_err(|_| IdMapParseError::InvalidNumber {
                        index,
                        field: field.to_owned(),
                    })
            };
            map.map_many(parse(inside)?, parse(outside)?, parse(length)?);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_in_order() {
        let map: IdMap = "0 1000 1,1 1001 1".parse().unwrap();
        assert_eq!(
            map.mappings(),
            &[
                Mapping {
                    inside_id: 0,
                    outside_id: 1000,
                    length: 1
                },
                Mapping {
                    inside_id: 1,
                    outside_id: 1001,
                    length: 1
                },
            ]
        );
    }

    #[test]
    fn commas_become_newlines() {
        let map: IdMap = "0 1000 1,1 1001 1".parse().unwrap();
        assert_eq!(map.to_proc_contents(), "0 1000 1\n1 1001 1");
    }

    #[test]
    fn tolerates_extra_whitespace() {
        let map: IdMap = "  0   100000  65536 ".parse().unwrap();
        assert_eq!(map.to_proc_contents(), "0 100000 65536");
    }

    #[test]
    fn one_trailing_separator_is_ignored() {
        let expected: IdMap = "0 1000 1".parse().unwrap();
        assert_eq!("0 1000 1,".parse::<IdMap>(), Ok(expected.clone()));
        assert_eq!("0 1000 1\n".parse::<IdMap>(), Ok(expected));
    }

    #[test]
    fn zero_to_matches_explicit_record() {
        let explicit: IdMap = "0 1000 1".parse().unwrap();
        assert_eq!(IdMap::zero_to(1000), explicit);
    }

    #[test]
    fn rejects_malformed_records() {
        assert_eq!("".parse::<IdMap>(), Err(IdMapParseError::Empty));
        assert!(matches!(
            "0 1000".parse::<IdMap>(),
            Err(IdMapParseError::FieldCount { index: 0, .. })
        ));
        assert!(matches!(
            "0 1000 1,,".parse::<IdMap>(),
            Err(IdMapParseError::FieldCount { index: 1, .. })
        ));
        assert_eq!(",".parse::<IdMap>(), Err(IdMapParseError::Empty));
        assert!(matches!(
            "0 -5 1".parse::<IdMap>(),
            Err(IdMapParseError::InvalidNumber { index: 0, .. })
        ));
        assert!(matches!(
            "0 1000 1 7".parse::<IdMap>(),
            Err(IdMapParseError::FieldCount { .. })
        ));
    }

    #[test]
    fn ranges_are_not_checked_here() {
        // Overlapping ranges are syntactically fine; the kernel rejects them at write time.
        let map: IdMap = "0 1000 10,5 2000 10".parse().unwrap();
        assert_eq!(map.mappings().len(), 2);
    }
}
