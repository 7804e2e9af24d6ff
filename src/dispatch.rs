//! Invoking the application and classifying how its future ended.
//!
//! The stream tasks (HTTP/1.1 exchange, HTTP/2 stream, WebSocket session)
//! own the wire; this module owns the policy for what an app outcome means
//! for the wire: a 500, a reset, or nothing at all.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use crate::app::{Application, Receiver, Scope, Sender};
use crate::error::Error;

/// Spawn the application future for one scope. Panics inside the app are
/// contained by the task and surface through [`classify`].
pub(crate) fn spawn<A: Application>(
    app: &Arc<A>,
    scope: Scope,
    receiver: Receiver,
    sender: Sender,
) -> JoinHandle<crate::Result<()>> {
    let app = app.clone();
    tokio::spawn(async move { app.call(scope, receiver, sender).await })
}

/// What the stream task should do after the app future settles.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Response complete; nothing further owed on the wire.
    Complete,
    /// Nothing (or only headers) was sent: answer 500 with a plain body.
    ErrorResponse(Error),
    /// The response was underway; the stream or connection must die.
    Abort(Error),
}

/// Apply the error policy: failure before `response.start` becomes a 500,
/// failure after becomes a stream teardown, and a clean return without a
/// complete response is a 500 with an operator-facing diagnostic.
pub(crate) fn classify(
    joined: Result<crate::Result<()>, JoinError>,
    response_started: bool,
    response_ended: bool,
) -> Disposition {
    let result = match joined {
        Ok(result) => result,
        Err(join_err) => {
            let cause = if join_err.is_panic() {
                "application panicked"
            } else {
                "application task canceled"
            };
            error!("{}", cause);
            let err = Error::new_user_application(cause);
            return if response_started {
                Disposition::Abort(err)
            } else {
                Disposition::ErrorResponse(err)
            };
        }
    };

    match result {
        Ok(()) => {
            if response_ended {
                Disposition::Complete
            } else if response_started {
                error!("application returned mid-response; closing stream");
                Disposition::Abort(Error::new_user_no_response())
            } else {
                error!(
                    "application returned without sending a response; \
                     replying 500 (did it forget `http.response.start`?)"
                );
                Disposition::ErrorResponse(Error::new_user_no_response())
            }
        }
        Err(err) if err.is_closed() => {
            // The peer went away and the app saw its send fail. Not a
            // programmer error.
            debug!("application ended after peer disconnect");
            Disposition::Complete
        }
        Err(err) => {
            error!("application error: {}", err);
            let err = Error::new_user_application(err);
            if response_started {
                // failure after response.start closes the stream, even
                // when the final body event already went out
                Disposition::Abort(err)
            } else {
                Disposition::ErrorResponse(err)
            }
        }
    }
}
