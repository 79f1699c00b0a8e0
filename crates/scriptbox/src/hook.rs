use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::{applet::Applet, error::BoxError, value::Value};

/// Lifecycle events a sandbox announces to its hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The sandbox was constructed.
    Start,
    /// First compile or explicit initialization; fires once.
    Initialized,
    /// Reserved for per-invocation notification.
    BeforeRun,
    /// The sandbox is shutting down.
    Stop,
}

impl Signal {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Initialized => "initialized",
            Self::BeforeRun => "before_run",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type HookFn = dyn Fn(Arc<Applet>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// Callback bound to one [`Signal`].
#[derive(Clone)]
pub struct Hook {
    signal: Signal,
    f: Arc<HookFn>,
}

impl Hook {
    pub fn new<F, Fut>(signal: Signal, f: F) -> Self
    where
        F: Fn(Arc<Applet>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            signal,
            f: Arc::new(move |applet| f(applet).boxed()),
        }
    }

    /// Run the script at `path` inside the sandbox when `signal` fires. The
    /// script sees the signal name bound as `signal`.
    pub fn script(signal: Signal, path: impl Into<String>) -> Self {
        let path: String = path.into();
        Self::new(signal, move |applet| {
            let path = path.clone();
            async move {
                let bindings = BTreeMap::from([(
                    "signal".to_string(),
                    Value::from(signal.as_str()),
                )]);
                applet
                    .run_file(&path, bindings, &CancellationToken::new())
                    .await?;
                Ok(())
            }
        })
    }

    #[must_use]
    pub const fn signal(&self) -> Signal {
        self.signal
    }

    pub(crate) async fn fire(&self, applet: Arc<Applet>) -> Result<(), BoxError> {
        (self.f)(applet).await
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("signal", &self.signal).finish()
    }
}
