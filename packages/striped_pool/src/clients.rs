mod hw_info_client;
mod hw_info_facade;

pub(crate) use hw_info_client::*;
pub(crate) use hw_info_facade::*;
