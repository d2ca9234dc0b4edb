pub(crate) mod meta;
pub(crate) mod migrate;
pub(crate) mod run;
pub(crate) mod shared;
pub(crate) mod status;
pub(crate) mod watch;
