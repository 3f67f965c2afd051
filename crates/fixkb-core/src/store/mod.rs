pub mod atomic;
pub mod branches;
pub mod fix_store;
pub mod ledger;
pub mod remote_cache;
pub mod schema;
