//! Operating-system collaborators: accounts, terminals, login records.

pub mod pty;
pub mod users;
pub mod utmp;
