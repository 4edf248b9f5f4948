mod claim;
mod retry;
mod shutdown;
mod support;
mod timeout;
