//! Server-side sessions addressed by an opaque cookie.
//!
//! The browser only ever holds a random session id. Tokens live in a [`SessionStore`] under
//! the entry names below, so they never reach JavaScript and can be wiped in one call on logout.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use moka::future::Cache;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{debug, trace};

use crate::{
    AppState,
    auth::utils::generate_random_token,
    errors::{Error, Result},
};

/// Entry holding the base64 `state` parameter of an in-flight authorization request.
pub const STATE_COOKIE_NAME: &str = "state";
/// Entry holding a raw id token, either provider-issued or locally signed.
pub const ID_TOKEN_COOKIE_NAME: &str = "id_token";
pub const ACCESS_TOKEN_COOKIE_NAME: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE_NAME: &str = "refresh_token";

pub const DEFAULT_SESSION_COOKIE_NAME: &str = "session";

/// Storage for session entries, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn exists(&self, session_id: &str) -> Result<bool>;
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>>;
    async fn put(&self, session_id: &str, key: &str, value: String) -> Result<()>;
    async fn remove(&self, session_id: &str, key: &str) -> Result<()>;
    /// Move every entry from `from` to `to`; `from` no longer exists afterwards.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    /// Drop every entry of the session.
    async fn destroy(&self, session_id: &str) -> Result<()>;
}

/// In-process session store; sessions expire `ttl` after they are created.
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Cache<String, Arc<DashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Cache::builder().time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.get(session_id).await.is_some())
    }

    async fn get(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .sessions
            .get(session_id)
            .await
            .and_then(|entries| entries.get(key).map(|v| v.value().clone())))
    }

    async fn put(&self, session_id: &str, key: &str, value: String) -> Result<()> {
        let entries = self
            .sessions
            .get_with(session_id.to_string(), async { Arc::new(DashMap::new()) })
            .await;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, session_id: &str, key: &str) -> Result<()> {
        if let Some(entries) = self.sessions.get(session_id).await {
            entries.remove(key);
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        if let Some(entries) = self.sessions.remove(from).await {
            self.sessions.insert(to.to_string(), entries).await;
        }
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        self.sessions.invalidate(session_id).await;
        Ok(())
    }
}

/// The session of the current request.
///
/// Cheap to clone; clones share the id and the flags that decide which cookie the response
/// carries.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: ArcSwap<String>,
    store: Arc<dyn SessionStore>,
    is_new: bool,
    written: AtomicBool,
    cycled: AtomicBool,
    destroyed: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>, store: Arc<dyn SessionStore>, is_new: bool) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: ArcSwap::from_pointee(id.into()),
                store,
                is_new,
                written: AtomicBool::new(false),
                cycled: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.inner.id.load().to_string()
    }

    pub fn is_new(&self) -> bool {
        self.inner.is_new
    }

    /// Value of an entry; empty values read as absent.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.inner.store.get(&self.id(), key).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub async fn put(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        debug!(key, size = value.len(), "storing session entry");
        self.inner.store.put(&self.id(), key, value).await?;
        self.inner.written.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.store.remove(&self.id(), key).await
    }

    /// Move the session to a fresh id, keeping its entries.
    ///
    /// Called whenever the session gains credentials, so an id known before login is worthless
    /// after it. The response carries a cookie for the new id.
    pub async fn cycle_id(&self) -> Result<()> {
        let old_id = self.id();
        let new_id = generate_random_token();

        self.inner.store.rename(&old_id, &new_id).await?;
        self.inner.id.store(Arc::new(new_id));
        self.inner.cycled.store(true, Ordering::Release);
        debug!("session id cycled");
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        self.inner.store.destroy(&self.id()).await?;
        self.inner.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    fn written(&self) -> bool {
        self.inner.written.load(Ordering::Acquire)
    }

    fn cycled(&self) -> bool {
        self.inner.cycled.load(Ordering::Acquire)
    }

    fn destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts.extensions.get::<Session>().cloned().ok_or_else(|| Error::Internal {
            operation: "load session: session middleware is not installed".to_string(),
        })
    }
}

/// Loads sessions from request cookies and writes the matching `Set-Cookie` header.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cookie_name: String,
    secure: bool,
    lifetime: Duration,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, cookie_name: impl Into<String>, secure: bool, lifetime: Duration) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
            secure,
            lifetime,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Session named by the request's cookie, or a fresh one when the cookie is absent or its
    /// session has expired.
    pub async fn load(&self, headers: &HeaderMap) -> Result<Session> {
        if let Some(id) = find_cookie(headers, &self.cookie_name) {
            if self.store.exists(&id).await? {
                trace!("resuming existing session");
                return Ok(Session::new(id, self.store.clone(), false));
            }
            debug!("session cookie refers to an unknown or expired session");
        }

        Ok(Session::new(generate_random_token(), self.store.clone(), true))
    }

    /// Cookie to send back for a session once the request has been handled.
    ///
    /// Destroyed sessions get an expired cookie. Sessions whose id was cycled always get the new
    /// id. New sessions get a cookie only if something was stored in them, so requests that fail
    /// before writing leave the browser untouched.
    pub fn set_cookie(&self, session: &Session) -> Option<HeaderValue> {
        let value = if session.destroyed() {
            format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", self.cookie_name)
        } else if session.cycled() || (session.is_new() && session.written()) {
            format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                self.cookie_name,
                session.id(),
                self.lifetime.as_secs()
            )
        } else {
            return None;
        };

        let value = if self.secure { format!("{value}; Secure") } else { value };
        HeaderValue::from_str(&value).ok()
    }
}

/// Value of the cookie `name` across all `Cookie` headers.
pub fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(cookie_name, value)| *cookie_name == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Attach the request's [`Session`] and emit its cookie on the way out.
pub async fn session_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response> {
    let session = state.sessions.load(request.headers()).await?;
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;

    if let Some(cookie) = state.sessions.set_cookie(&session) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
