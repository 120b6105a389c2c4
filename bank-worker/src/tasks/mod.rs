//! Business tasks executed by the processor.

pub mod send_verify_email;

use std::sync::Arc;

use url::Url;

use crate::mail::EmailSender;
use crate::processor::{HandlerMux, RegistryError};
use crate::store::Store;

pub use send_verify_email::{
    distribute_send_verify_email, PayloadSendVerifyEmail, SendVerifyEmailHandler,
    TASK_SEND_VERIFY_EMAIL,
};

/// Register every task handler this service knows about.
pub fn register_handlers(
    mux: &mut HandlerMux,
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    verify_url: Url,
) -> Result<(), RegistryError> {
    mux.register(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(store, mailer, verify_url)),
    )?;
    Ok(())
}
