//! Routes and compiled routes used to derive ratelimit bucket identities.
//!
//! A [`Route`] is the template of an API endpoint: its method and its path
//! with the major parameters unbound. The manager remembers server-assigned
//! bucket hashes per template. A [`CompiledRoute`] binds the template to
//! concrete major parameter values, which together with the hash and an
//! authentication fingerprint form the registry identity of a bucket.

use std::{
    borrow::Cow,
    fmt::{Display, Formatter, Result as FmtResult},
    hash::{Hash, Hasher},
};

/// HTTP method of a request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    /// DELETE method.
    Delete,
    /// GET method.
    Get,
    /// PATCH method.
    Patch,
    /// POST method.
    Post,
    /// PUT method.
    Put,
}

impl Method {
    /// Name of the method.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Patch => "PATCH",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

/// Template of an API route with its major parameters unbound.
///
/// Equality and hashing consider the method and the path template only,
/// making the template usable as the key under which a route's
/// server-assigned bucket hash is remembered.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Route {
    /// Method used when requesting the route.
    method: Method,
    /// Path with `{placeholder}` segments for its parameters.
    path_template: Cow<'static, str>,
}

impl Route {
    /// Create a new route template.
    #[must_use]
    pub fn new(method: Method, path_template: impl Into<Cow<'static, str>>) -> Self {
        Self {
            method,
            path_template: path_template.into(),
        }
    }

    /// Method used when requesting the route.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Path template of the route.
    #[must_use]
    pub fn path_template(&self) -> &str {
        &self.path_template
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.method, f)?;
        f.write_str(" ")?;

        f.write_str(&self.path_template)
    }
}

/// A route template bound to concrete values for its major parameters.
///
/// Two compiled routes are equivalent for bucketing when their templates
/// and major parameter values match, regardless of the rest of the path;
/// equality and hashing reflect that.
#[derive(Clone, Debug)]
pub struct CompiledRoute {
    /// Template the route was compiled from.
    route: Route,
    /// Concrete path of the request.
    path: String,
    /// Major parameter values of the route, in template order.
    ///
    /// Major parameters are the ones the API treats as bucket
    /// discriminators: channel id, guild id, webhook id and token.
    major_params: String,
}

impl CompiledRoute {
    /// Bind a route template to concrete parameter values.
    #[must_use]
    pub fn new(route: Route, path: impl Into<String>, major_params: impl Into<String>) -> Self {
        Self {
            route,
            path: path.into(),
            major_params: major_params.into(),
        }
    }

    /// Template the route was compiled from.
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// Concrete path of the request.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Major parameter values of the route.
    #[must_use]
    pub fn major_params(&self) -> &str {
        &self.major_params
    }

    /// Compose the registry identity of the route's bucket under the given
    /// bucket hash and authentication fingerprint.
    #[must_use]
    pub fn real_bucket_hash(&self, initial_hash: &str, auth_hash: &str) -> String {
        format!("{initial_hash};{auth_hash};{}", self.major_params)
    }
}

impl Display for CompiledRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.route.method, f)?;
        f.write_str(" ")?;

        f.write_str(&self.path)
    }
}

impl PartialEq for CompiledRoute {
    fn eq(&self, other: &Self) -> bool {
        self.route == other.route && self.major_params == other.major_params
    }
}

impl Eq for CompiledRoute {}

impl Hash for CompiledRoute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.route.hash(state);
        self.major_params.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::{CompiledRoute, Method, Route};
    use static_assertions::assert_impl_all;
    use std::{
        collections::hash_map::DefaultHasher,
        fmt::{Debug, Display},
        hash::{Hash, Hasher},
    };

    assert_impl_all!(Method: Clone, Copy, Debug, Display, Eq, PartialEq, Send, Sync);
    assert_impl_all!(Route: Clone, Debug, Display, Eq, Hash, PartialEq, Send, Sync);
    assert_impl_all!(CompiledRoute: Clone, Debug, Display, Eq, Hash, PartialEq, Send, Sync);

    fn hash_of(value: &impl Hash) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);

        hasher.finish()
    }

    #[test]
    fn method_names() {
        assert_eq!("DELETE", Method::Delete.name());
        assert_eq!("GET", Method::Get.name());
        assert_eq!("PATCH", Method::Patch.name());
        assert_eq!("POST", Method::Post.name());
        assert_eq!("PUT", Method::Put.name());
    }

    #[test]
    fn templates_bucket_by_method_and_path() {
        let get = Route::new(Method::Get, "/channels/{channel}/messages");
        let get_again = Route::new(Method::Get, String::from("/channels/{channel}/messages"));
        let post = Route::new(Method::Post, "/channels/{channel}/messages");

        assert_eq!(get, get_again);
        assert_eq!(hash_of(&get), hash_of(&get_again));
        assert_ne!(get, post);
    }

    #[test]
    fn compiled_routes_bucket_by_template_and_majors() {
        let template = Route::new(Method::Get, "/channels/{channel}/messages");
        let first = CompiledRoute::new(template.clone(), "/channels/1/messages", "1");
        let first_with_query =
            CompiledRoute::new(template.clone(), "/channels/1/messages?limit=5", "1");
        let second = CompiledRoute::new(template, "/channels/2/messages", "2");

        assert_eq!(first, first_with_query);
        assert_eq!(hash_of(&first), hash_of(&first_with_query));
        assert_ne!(first, second);
    }

    #[test]
    fn real_bucket_hash_composition() {
        let route = CompiledRoute::new(
            Route::new(Method::Get, "/channels/{channel}/messages"),
            "/channels/1234/messages",
            "1234",
        );

        assert_eq!("abc123;auth456;1234", route.real_bucket_hash("abc123", "auth456"));
        assert_eq!("UNKNOWN;auth456;1234", route.real_bucket_hash("UNKNOWN", "auth456"));
    }
}
