//! DOM extraction for search-result pages and company profile pages.

use chrono::{DateTime, Utc};
use ilg_browser::PageSession;
use ilg_core::{CompanyProfile, JobListing};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "ilg-extract";

const RESULT_CARD: &str = "td.resultContent";
const CARD_TITLE: &str = "h2.jobTitle a span";
const CARD_LINK: &str = "h2.jobTitle a";
const CARD_COMPANY: &str = r#"span[data-testid="company-name"]"#;
const CARD_LOCATION: &str = r#"div[data-testid="text-location"]"#;
const NEXT_PAGE_LINK: &str = r#"a[data-testid="pagination-page-next"]"#;
const JOB_HEADER_LINK: &str = "div.jobsearch-InfoHeaderContainer a";

/// Runs inside the profile page. Resolves to `null` when the page has no
/// about section; otherwise collects the labeled company facts. The
/// headquarters value often sits behind a modal toggle, so the script clicks
/// it, waits for the dialog, and falls back to the inline text.
const PROFILE_SCRIPT: &str = r#"
(async () => {
    const about = document.querySelector('section[data-testid="AboutSection-section"]');
    if (!about) {
        return null;
    }
    const item = (id) => {
        const li = about.querySelector(`li[data-testid="${id}"]`);
        if (!li) {
            return null;
        }
        const divs = li.querySelectorAll('div');
        return divs.length > 1 ? divs[1].innerText.trim() : null;
    };
    const profile = {
        ceo: item('companyInfo-ceo'),
        size: item('companyInfo-employee'),
        sales_volume: item('companyInfo-revenue'),
        industry: item('companyInfo-industry'),
        company_url: item('companyInfo-companyWebsite'),
        founded: item('companyInfo-founded'),
        headquarters: null,
    };
    const hq = about.querySelector('li[data-testid="companyInfo-headquartersLocation"]');
    if (hq) {
        const toggle = hq.querySelector('button');
        if (toggle) {
            toggle.click();
            await new Promise((resolve) => setTimeout(resolve, 1000));
            const modal = document.querySelector('div[aria-labelledby="modal-1-title"] span');
            if (modal) {
                profile.headquarters = modal.innerText.trim();
            }
        }
        if (!profile.headquarters) {
            const divs = hq.querySelectorAll('div');
            if (divs.length > 1) {
                profile.headquarters = divs[1].innerText.trim();
            }
        }
    }
    return profile;
})()
"#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Browser(#[from] ilg_browser::BrowserError),
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Pull the job cards out of one rendered search-result page. Cards missing
/// a title, a company name, or a resolvable link are skipped rather than
/// failing the whole page.
pub fn extract_listings(
    html: &str,
    base_url: &Url,
    now: DateTime<Utc>,
) -> Result<Vec<JobListing>, ExtractError> {
    let card_sel = parse_selector(RESULT_CARD)?;
    let title_sel = parse_selector(CARD_TITLE)?;
    let link_sel = parse_selector(CARD_LINK)?;
    let company_sel = parse_selector(CARD_COMPANY)?;
    let location_sel = parse_selector(CARD_LOCATION)?;

    let document = Html::parse_document(html);
    let mut listings = Vec::new();
    for card in document.select(&card_sel) {
        let Some(title) = first_text(card, &title_sel) else {
            continue;
        };
        let Some(company) = first_text(card, &company_sel) else {
            continue;
        };
        let Some(link) = first_attr(card, &link_sel, "href")
            .and_then(|href| base_url.join(&href).ok())
        else {
            continue;
        };
        let location = first_text(card, &location_sel).unwrap_or_default();
        listings.push(JobListing {
            title,
            company,
            location,
            link: link.to_string(),
            posted_at: now,
        });
    }
    Ok(listings)
}

/// Whether a rendered search-result page links to a further page.
pub fn has_next_page(html: &str) -> Result<bool, ExtractError> {
    let sel = parse_selector(NEXT_PAGE_LINK)?;
    let document = Html::parse_document(html);
    Ok(document.select(&sel).next().is_some())
}

/// The company-profile link from a rendered job-detail page, if the header
/// carries one.
pub fn extract_company_profile_url(
    html: &str,
    base_url: &Url,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(JOB_HEADER_LINK)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr("href"))
        .and_then(|href| base_url.join(href).ok())
        .map(|u| u.to_string()))
}

/// Scrape the about section of the currently loaded profile page. `None`
/// means the page carries no about section at all.
pub async fn extract_company_profile(
    page: &PageSession,
) -> Result<Option<CompanyProfile>, ExtractError> {
    let profile = page.evaluate_json::<Option<CompanyProfile>>(PROFILE_SCRIPT).await?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> Url {
        Url::parse("https://de.indeed.com").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 5, 12, 0, 0).single().unwrap()
    }

    const RESULTS_PAGE: &str = r#"
        <html><body><table><tr>
        <td class="resultContent">
            <h2 class="jobTitle"><a href="/rc/clk?jk=abc"><span>Pflegefachkraft (m/w/d)</span></a></h2>
            <span data-testid="company-name">Acme Pflege GmbH</span>
            <div data-testid="text-location">Berlin</div>
        </td>
        <td class="resultContent">
            <h2 class="jobTitle"><a href="/rc/clk?jk=def"><span>Erzieher</span></a></h2>
            <div data-testid="text-location">Hamburg</div>
        </td>
        </tr></table></body></html>
    "#;

    #[test]
    fn cards_without_a_company_are_skipped() {
        let listings = extract_listings(RESULTS_PAGE, &base(), now()).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Pflegefachkraft (m/w/d)");
        assert_eq!(listings[0].company, "Acme Pflege GmbH");
        assert_eq!(listings[0].location, "Berlin");
        assert_eq!(listings[0].link, "https://de.indeed.com/rc/clk?jk=abc");
        assert_eq!(listings[0].posted_at, now());
    }

    #[test]
    fn empty_page_yields_no_listings() {
        let listings = extract_listings("<html><body></body></html>", &base(), now()).unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn next_page_probe_matches_the_pagination_link() {
        let with_next = r#"<a data-testid="pagination-page-next" href="/jobs?q=x&start=10">Next</a>"#;
        assert!(has_next_page(with_next).unwrap());
        assert!(!has_next_page("<div>no pagination here</div>").unwrap());
    }

    #[test]
    fn profile_url_comes_from_the_job_header() {
        let html = r#"
            <div class="jobsearch-InfoHeaderContainer">
                <a href="/cmp/acme-pflege">Acme Pflege GmbH</a>
            </div>
        "#;
        let url = extract_company_profile_url(html, &base()).unwrap();
        assert_eq!(url.as_deref(), Some("https://de.indeed.com/cmp/acme-pflege"));
    }

    #[test]
    fn missing_header_yields_no_profile_url() {
        let url = extract_company_profile_url("<div>plain page</div>", &base()).unwrap();
        assert!(url.is_none());
    }
}
