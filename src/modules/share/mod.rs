pub mod contact;
pub mod document;
pub mod http;
pub mod vcard;
