//! x86_64 specific

pub mod page_table;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring3 = 3,
}

impl PrivilegeLevel {
    /// Privilege level encoded in the low bits of a segment selector.
    pub const fn of_selector(selector: u16) -> Self {
        if selector & 3 == 3 {
            PrivilegeLevel::Ring3
        } else {
            PrivilegeLevel::Ring0
        }
    }
}
