pub(crate) mod apply;
pub(crate) mod extract;
pub(crate) mod serve;
