pub mod backend;
pub mod batch;
pub mod config;
pub mod google_auth;
pub mod history;
pub mod mailer;
pub mod quota;
pub mod recipients;
pub mod report;
pub mod session;
pub mod template;
pub mod types;
