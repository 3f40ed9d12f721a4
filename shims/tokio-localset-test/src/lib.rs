//! `#[localset_test]`: turns `async fn name() { .. }` into a `#[test]` that
//! runs the body inside a `tokio::task::LocalSet` on a current-thread runtime.

use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

#[proc_macro_attribute]
pub fn localset_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();
    let body = match tokens.pop() {
        Some(TokenTree::Group(g)) if g.delimiter() == Delimiter::Brace => g,
        _ => panic!("#[localset_test] expects an `async fn` with a body"),
    };
    let signature: TokenStream = tokens
        .into_iter()
        .filter(|t| !matches!(t, TokenTree::Ident(i) if i.to_string() == "async"))
        .collect();
    let wrapper: TokenStream = format!(
        "{{ let rt = ::tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap(); \
           let local = ::tokio::task::LocalSet::new(); \
           local.block_on(&rt, async move {}) }}",
        body
    )
    .parse()
    .unwrap();
    let mut out: TokenStream = "#[::core::prelude::v1::test]".parse().unwrap();
    out.extend(signature);
    out.extend(wrapper.into_iter().map(|t| match t {
        TokenTree::Group(g) => TokenTree::Group(Group::new(g.delimiter(), g.stream())),
        t => t,
    }));
    out
}
