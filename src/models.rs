use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelTokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl ModelTokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub total_messages: u64,
    pub today_messages: u64,
    pub week_messages: u64,
    #[serde(default)]
    pub model_usage: BTreeMap<String, ModelTokenUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Api,
    Cli,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub session_used: f64,
    pub session_limit: f64,
    pub weekly_used: f64,
    pub weekly_limit: f64,
    pub session_reset: Option<DateTime<Utc>>,
    pub weekly_reset: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub rate_limit_tier: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
    pub source: UsageSource,
}

impl RateLimitSnapshot {
    pub fn percent_scale(source: UsageSource, now: DateTime<Utc>) -> Self {
        Self {
            session_used: 0.0,
            session_limit: 100.0,
            weekly_used: 0.0,
            weekly_limit: 100.0,
            session_reset: None,
            weekly_reset: None,
            last_updated: now,
            rate_limit_tier: None,
            subscription_type: None,
            source,
        }
    }

    /// Session usage with the reset rule applied: a window whose reset time
    /// has passed counts as unused until a fresh fetch replaces it.
    pub fn effective_session_used(&self, now: DateTime<Utc>) -> f64 {
        effective_used(self.session_used, self.session_reset, now)
    }

    pub fn effective_weekly_used(&self, now: DateTime<Utc>) -> f64 {
        effective_used(self.weekly_used, self.weekly_reset, now)
    }

    pub fn session_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.session_limit - self.effective_session_used(now)).max(0.0)
    }

    pub fn weekly_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.weekly_limit - self.effective_weekly_used(now)).max(0.0)
    }

    pub fn session_usage_ratio(&self, now: DateTime<Utc>) -> f64 {
        usage_ratio(self.effective_session_used(now), self.session_limit)
    }

    pub fn weekly_usage_ratio(&self, now: DateTime<Utc>) -> f64 {
        usage_ratio(self.effective_weekly_used(now), self.weekly_limit)
    }
}

fn effective_used(used: f64, reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match reset {
        Some(reset_at) if reset_at <= now => 0.0,
        _ => used,
    }
}

fn usage_ratio(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    used / limit
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub authenticated: bool,
    #[serde(default)]
    pub last_switched: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: Option<UsageSnapshot>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSnapshot>,
}

fn default_true() -> bool {
    true
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            username: None,
            is_active: false,
            authenticated: true,
            last_switched: None,
            usage: None,
            rate_limit: None,
        }
    }

    pub fn display_label(&self) -> String {
        match self.username.as_deref() {
            Some(username) if username != self.name => format!("{} ({})", self.name, username),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub active_profile_id: Option<String>,
    #[serde(default)]
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl Registry {
    pub fn find(&self, profile_id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == profile_id)
    }

    pub fn find_mut(&mut self, profile_id: &str) -> Option<&mut Profile> {
        self.profiles
            .iter_mut()
            .find(|profile| profile.id == profile_id)
    }

    /// Looks a profile up by id first, then by exact name, then by
    /// case-insensitive name.
    pub fn resolve(&self, name_or_id: &str) -> Option<&Profile> {
        let needle = name_or_id.trim();
        self.find(needle)
            .or_else(|| self.profiles.iter().find(|profile| profile.name == needle))
            .or_else(|| {
                self.profiles
                    .iter()
                    .find(|profile| profile.name.eq_ignore_ascii_case(needle))
            })
    }

    pub fn active(&self) -> Option<&Profile> {
        let active_id = self.active_profile_id.as_deref()?;
        self.find(active_id)
    }

    pub fn contains(&self, profile_id: &str) -> bool {
        self.find(profile_id).is_some()
    }

    /// Makes `profile_id` the only active profile. Returns false when the id
    /// is unknown, leaving the registry untouched.
    pub fn set_active(&mut self, profile_id: &str, now: DateTime<Utc>) -> bool {
        if !self.contains(profile_id) {
            return false;
        }
        for profile in &mut self.profiles {
            profile.is_active = profile.id == profile_id;
            if profile.is_active {
                profile.last_switched = Some(now);
            }
        }
        self.active_profile_id = Some(profile_id.to_string());
        true
    }

    pub fn upsert(&mut self, profile: Profile) {
        if let Some(index) = self
            .profiles
            .iter()
            .position(|item| item.id == profile.id)
        {
            self.profiles[index] = profile;
        } else {
            self.profiles.push(profile);
        }
    }

    pub fn remove(&mut self, profile_id: &str) -> Option<Profile> {
        let index = self
            .profiles
            .iter()
            .position(|profile| profile.id == profile_id)?;
        if self.active_profile_id.as_deref() == Some(profile_id) {
            self.active_profile_id = None;
        }
        Some(self.profiles.remove(index))
    }

    /// Repairs registries written by older builds or edited by hand: the
    /// active pointer wins over stale flags, and a dangling pointer is
    /// dropped.
    pub fn normalize(&mut self) {
        let pointer = self
            .active_profile_id
            .clone()
            .filter(|id| self.contains(id))
            .or_else(|| {
                self.profiles
                    .iter()
                    .find(|profile| profile.is_active)
                    .map(|profile| profile.id.clone())
            });
        for profile in &mut self.profiles {
            profile.is_active = pointer.as_deref() == Some(profile.id.as_str());
        }
        self.active_profile_id = pointer;

        let mut seen = std::collections::HashSet::new();
        self.profiles.retain(|profile| seen.insert(profile.id.clone()));
    }

    pub fn active_count(&self) -> usize {
        self.profiles
            .iter()
            .filter(|profile| profile.is_active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()
    }

    fn registry_with(names: &[&str]) -> Registry {
        let mut registry = Registry::default();
        for name in names {
            registry.upsert(Profile::new(name));
        }
        registry
    }

    #[test]
    fn past_reset_time_restores_full_remaining() {
        let mut snapshot = RateLimitSnapshot::percent_scale(UsageSource::Api, now());
        snapshot.session_used = 95.0;
        snapshot.session_reset = Some(now() - Duration::minutes(1));
        assert_eq!(snapshot.session_remaining(now()), 100.0);
        assert_eq!(snapshot.effective_session_used(now()), 0.0);

        snapshot.session_reset = Some(now() + Duration::minutes(1));
        assert_eq!(snapshot.session_remaining(now()), 5.0);
        assert!((snapshot.session_usage_ratio(now()) - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let mut snapshot = RateLimitSnapshot::percent_scale(UsageSource::Cli, now());
        snapshot.weekly_used = 130.0;
        assert_eq!(snapshot.weekly_remaining(now()), 0.0);
    }

    #[test]
    fn set_active_keeps_exactly_one_active() {
        let mut registry = registry_with(&["work", "home", "spare"]);
        let ids = registry
            .profiles
            .iter()
            .map(|profile| profile.id.clone())
            .collect::<Vec<_>>();
        for id in &ids {
            assert!(registry.set_active(id, now()));
            assert_eq!(registry.active_count(), 1);
            assert_eq!(registry.active().map(|profile| profile.id.as_str()), Some(id.as_str()));
        }
        assert!(!registry.set_active("missing", now()));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn resolve_matches_id_then_name() {
        let registry = registry_with(&["Work", "home"]);
        let work_id = registry.profiles[0].id.clone();
        assert_eq!(registry.resolve(&work_id).map(|p| p.name.as_str()), Some("Work"));
        assert_eq!(registry.resolve("home").map(|p| p.name.as_str()), Some("home"));
        assert_eq!(registry.resolve("work").map(|p| p.name.as_str()), Some("Work"));
        assert!(registry.resolve("nobody").is_none());
    }

    #[test]
    fn normalize_repairs_conflicting_flags() {
        let mut registry = registry_with(&["a", "b"]);
        registry.profiles[0].is_active = true;
        registry.profiles[1].is_active = true;
        registry.active_profile_id = Some(registry.profiles[1].id.clone());
        registry.normalize();
        assert_eq!(registry.active_count(), 1);
        assert!(registry.profiles[1].is_active);

        registry.active_profile_id = Some("dangling".to_string());
        registry.normalize();
        assert_eq!(registry.active_profile_id.as_deref(), Some(registry.profiles[1].id.as_str()));
    }

    #[test]
    fn registry_round_trips_through_camel_case_json() {
        let mut registry = registry_with(&["work"]);
        let id = registry.profiles[0].id.clone();
        registry.set_active(&id, now());
        let json = serde_json::to_value(&registry).expect("encode");
        assert_eq!(json["activeProfileId"], id.as_str());
        assert_eq!(json["profiles"][0]["isActive"], true);
        let decoded: Registry = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, registry);
    }

    #[test]
    fn legacy_profiles_default_to_authenticated() {
        let decoded: Profile =
            serde_json::from_str(r#"{"id":"p","name":"old"}"#).expect("decode");
        assert!(decoded.authenticated);
        assert!(!decoded.is_active);
    }
}
