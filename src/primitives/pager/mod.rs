#![forbid(unsafe_code)]

mod store;

pub use store::{
    validate_page_size, PageStore, StoreHeader, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
    STORE_HEADER_LEN,
};
