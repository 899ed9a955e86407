//! Batch deduplication: records that share an identifier are one work.
//! Connected components are found over identifier equality in priority
//! order (PMID > PMCID > DOI > title+first-author+year) and merged with
//! authority-weighted field selection.

use std::collections::HashMap;

use crate::entities::UnifiedArticle;

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index wins so output order follows first occurrence.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Identifier keys for one article, tagged by key space and listed in
/// priority order.
fn keys(article: &UnifiedArticle) -> Vec<(u8, String)> {
    let mut out = Vec::new();
    if let Some(pmid) = &article.pmid {
        out.push((0, pmid.clone()));
    }
    if let Some(pmcid) = &article.pmcid {
        out.push((1, pmcid.to_ascii_uppercase()));
    }
    if let Some(doi) = &article.doi {
        out.push((2, doi.clone()));
    }
    if let Some(near) = article.near_match_key() {
        out.push((3, near));
    }
    out
}

/// Merge a batch. Output preserves the input order of each component's
/// first member. Idempotent: running it twice changes nothing.
pub fn dedup(articles: Vec<UnifiedArticle>) -> Vec<UnifiedArticle> {
    if articles.len() <= 1 {
        return articles;
    }

    let mut dsu = Dsu::new(articles.len());
    let mut by_key: HashMap<(u8, String), usize> = HashMap::new();
    for (i, article) in articles.iter().enumerate() {
        for key in keys(article) {
            match by_key.get(&key) {
                Some(first) => dsu.union(i, *first),
                None => {
                    by_key.insert(key, i);
                }
            }
        }
    }

    let mut components: Vec<(usize, Vec<UnifiedArticle>)> = Vec::new();
    let mut root_slot: HashMap<usize, usize> = HashMap::new();
    for (i, article) in articles.into_iter().enumerate() {
        let root = dsu.find(i);
        match root_slot.get(&root) {
            Some(slot) => components[*slot].1.push(article),
            None => {
                root_slot.insert(root, components.len());
                components.push((root, vec![article]));
            }
        }
    }

    components
        .into_iter()
        .map(|(_, members)| merge_component(members))
        .collect()
}

fn best_authority(article: &UnifiedArticle) -> u8 {
    article
        .provenance
        .iter()
        .map(|p| p.source.authority())
        .max()
        .unwrap_or(0)
}

fn merge_component(members: Vec<UnifiedArticle>) -> UnifiedArticle {
    if members.len() == 1 {
        return members.into_iter().next().expect("non-empty component");
    }

    // Authority order, stable across equal-authority members so the
    // first-written value wins inside a tier.
    let mut ordered: Vec<UnifiedArticle> = members;
    let provenance_total: usize = ordered.iter().map(|m| m.provenance.len()).sum();
    ordered.sort_by(|a, b| best_authority(b).cmp(&best_authority(a)));

    let mut iter = ordered.into_iter();
    let mut merged = iter.next().expect("non-empty component");

    for member in iter {
        if merged.pmid.is_none() {
            merged.pmid = member.pmid.clone();
        }
        if merged.pmcid.is_none() {
            merged.pmcid = member.pmcid.clone();
        }
        if merged.doi.is_none() {
            merged.doi = member.doi.clone();
        }
        for (source, id) in &member.other_ids {
            merged
                .other_ids
                .entry(source.clone())
                .or_insert_with(|| id.clone());
        }

        if merged.title.is_empty() && !member.title.is_empty() {
            merged.title = member.title.clone();
        }
        if merged.abstract_text.is_none() {
            merged.abstract_text = member.abstract_text.clone();
        }
        if merged.journal.is_none() {
            merged.journal = member.journal.clone();
        }
        if merged.language.is_none() {
            merged.language = member.language.clone();
        }
        if !merged.pub_date.is_known() && member.pub_date.is_known() {
            merged.pub_date = member.pub_date;
        }

        // Authors: keep the leading list's order, add unseen people.
        let mut seen: Vec<String> = merged.authors.iter().map(|a| a.merge_key()).collect();
        for author in &member.authors {
            let key = author.merge_key();
            if !seen.contains(&key) {
                seen.push(key);
                merged.authors.push(author.clone());
            }
        }

        for pt in &member.publication_types {
            if !merged.publication_types.contains(pt) {
                merged.publication_types.push(*pt);
            }
        }
        for term in &member.mesh_terms {
            if !merged.mesh_terms.contains(term) {
                merged.mesh_terms.push(term.clone());
            }
        }
        // Links union by kind keeps both on collision; the agent consumes
        // the first.
        for link in &member.links {
            if !merged.links.contains(link) {
                merged.links.push(link.clone());
            }
        }

        merged.citation_count = match (merged.citation_count, member.citation_count) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if merged.influential_citations.is_none() {
            merged.influential_citations = member.influential_citations;
        }
        if merged.impact.is_none() {
            merged.impact = member.impact;
        }

        merged.provenance.extend(member.provenance);
    }

    debug_assert_eq!(merged.provenance.len(), provenance_total);
    merged
}
