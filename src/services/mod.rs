//! Store capabilities, their local implementations and the pipeline that
//! coordinates them.

pub mod caption_parser;
pub mod caption_service;
pub mod content_store;
pub mod metadata_index;
pub mod naming;
pub mod pipeline;
