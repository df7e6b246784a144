use crate::instagram::EmbedResolver;
use crate::twitter::{Media as TwitterMedia, MediaVariant, Tweet};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Link prefix of posts the embed resolver knows how to scrape
pub const EMBED_DOMAIN_PREFIX: &str = "https://www.instagram.com";

/// Quote chains deeper than this are not followed
pub const MAX_QUOTE_DEPTH: usize = 16;

const FIRST_PARTY_MEDIA_PREFIXES: [&str; 2] =
    ["https://pbs.twimg.com/media", "http://pbs.twimg.com/media"];

/// A tweet plus the media URLs directly attributable to it
#[derive(Debug, Clone)]
pub struct ResolvedTweet {
    pub tweet: Tweet,
    pub urls: Vec<String>,
}

impl ResolvedTweet {
    pub fn id(&self) -> &str {
        &self.tweet.id_str
    }

    pub fn owner(&self) -> &str {
        &self.tweet.user.screen_name
    }

    pub fn has_media(&self) -> bool {
        !self.urls.is_empty()
    }
}

/// How a single node carries its media
#[derive(Debug, Clone, PartialEq)]
pub enum MediaKind<'a> {
    /// Photos/videos hosted by Twitter itself
    Native(&'a [TwitterMedia]),
    /// A link to a third-party post
    Embedded(String),
    None,
}

/// Decide where a node's media lives. Native media wins over embeds.
pub fn classify(tweet: &Tweet) -> MediaKind<'_> {
    if let Some(extended) = &tweet.extended_entities {
        if !extended.media.is_empty() {
            return MediaKind::Native(&extended.media);
        }
    }

    match embedded_post_url(tweet) {
        Some(url) => MediaKind::Embedded(url),
        None => MediaKind::None,
    }
}

/// First link entity pointing at the embed domain, preferring the expanded form
pub fn embedded_post_url(tweet: &Tweet) -> Option<String> {
    let entities = tweet.entities.as_ref()?;

    entities.urls.iter().find_map(|entity| {
        [entity.expanded_url.as_deref(), entity.url.as_deref()]
            .into_iter()
            .flatten()
            .find(|url| url.starts_with(EMBED_DOMAIN_PREFIX))
            .map(str::to_string)
    })
}

/// Photo URL, HTTPS preferred
pub fn select_photo_url(media: &TwitterMedia) -> Option<&str> {
    media
        .media_url_https
        .as_deref()
        .or(media.media_url.as_deref())
        .filter(|url| !url.is_empty())
}

/// Highest-bitrate variant among those that report a bitrate.
/// The first variant wins a tie; variants without a bitrate never win.
pub fn select_best_variant(variants: &[MediaVariant]) -> Option<&MediaVariant> {
    variants
        .iter()
        .filter_map(|variant| variant.bitrate.map(|bitrate| (bitrate, variant)))
        .fold(None, |best: Option<(u64, &MediaVariant)>, (bitrate, variant)| match best {
            Some((best_bitrate, _)) if best_bitrate >= bitrate => best,
            _ => Some((bitrate, variant)),
        })
        .map(|(_, variant)| variant)
}

/// URLs of a node's native media, in attachment order
pub fn native_media_urls(media_items: &[TwitterMedia]) -> Vec<String> {
    media_items
        .iter()
        .filter_map(|media| match media.type_field.as_str() {
            "photo" => select_photo_url(media).map(str::to_string),
            "video" => media
                .video_info
                .as_ref()
                .and_then(|info| select_best_variant(&info.variants))
                .map(|variant| variant.url.clone()),
            other => {
                debug!("Skipping media of unsupported type {other}");
                None
            }
        })
        .filter(|url| !url.is_empty())
        .collect()
}

/// Resolves tweet nodes into per-node media lists
pub struct MediaLocator<'a> {
    embed_resolver: &'a dyn EmbedResolver,
}

impl<'a> MediaLocator<'a> {
    pub fn new(embed_resolver: &'a dyn EmbedResolver) -> Self {
        Self { embed_resolver }
    }

    /// Resolve a node and everything it quotes.
    ///
    /// Quoted nodes come first; every visited node yields exactly one entry,
    /// keyed by its own id. An entry may have an empty URL list.
    pub async fn resolve(&self, tweet: &Tweet) -> Vec<ResolvedTweet> {
        let mut resolved = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(tweet.original());
        let mut chain = Vec::new();

        // Walk the quote chain outermost-first, then resolve innermost-first
        while let Some(node) = current {
            if chain.len() >= MAX_QUOTE_DEPTH {
                warn!(
                    "Quote chain of tweet {id} exceeds {MAX_QUOTE_DEPTH} levels, ignoring the rest",
                    id = tweet.id_str
                );
                break;
            }
            if !visited.insert(node.id_str.clone()) {
                warn!("Quote cycle detected at tweet {id}", id = node.id_str);
                break;
            }
            chain.push(node);
            current = node.quoted().map(Tweet::original);
        }

        for node in chain.into_iter().rev() {
            let urls = self.node_media_urls(node).await;
            resolved.push(ResolvedTweet {
                tweet: node.clone(),
                urls,
            });
        }

        resolved
    }

    /// Media of one node only, never of anything it quotes
    async fn node_media_urls(&self, node: &Tweet) -> Vec<String> {
        match classify(node) {
            MediaKind::Native(media_items) => native_media_urls(media_items),
            MediaKind::Embedded(post_url) => {
                match self.embed_resolver.resolve_media_urls(&post_url).await {
                    Ok(urls) => urls,
                    Err(e) => {
                        warn!(
                            "Failed to resolve embedded post {post_url} of tweet {id}: {e:#}",
                            id = node.id_str
                        );
                        Vec::new()
                    }
                }
            }
            MediaKind::None => Vec::new(),
        }
    }
}

/// Drop the query string of a URL, if any
pub fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

fn name_param_regex() -> &'static Regex {
    static NAME_PARAM: OnceLock<Regex> = OnceLock::new();
    NAME_PARAM.get_or_init(|| {
        Regex::new(r"([?&])name=[^&]*").expect("name parameter regex should always compile")
    })
}

/// Request the unscaled original of an image URL
pub fn original_image_url(url: &str) -> String {
    if !url.contains('?') {
        return format!("{url}?name=orig");
    }

    let name_param = name_param_regex();
    if name_param.is_match(url) {
        name_param.replace(url, "${1}name=orig").into_owned()
    } else {
        format!("{url}&name=orig")
    }
}

pub fn is_first_party_media(url: &str) -> bool {
    FIRST_PARTY_MEDIA_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

/// Rewrite first-party image URLs to their original-size variant; every
/// other URL is returned unchanged
pub fn normalize_media_url(url: &str) -> String {
    if is_first_party_media(url) {
        original_image_url(url)
    } else {
        url.to_string()
    }
}
