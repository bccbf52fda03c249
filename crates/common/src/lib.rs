// workshop-sync-common: wire types shared by the sync client and its tools

pub mod protocol;
pub mod types;
