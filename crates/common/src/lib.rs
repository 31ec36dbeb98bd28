// coedit-common: wire types shared by the relay and peer crates.

pub mod crdt;
pub mod protocol;
