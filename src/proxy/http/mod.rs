pub(crate) mod body;
pub(crate) mod codec;
pub(crate) mod respond;
pub(crate) mod server;
pub(crate) mod upstream;
